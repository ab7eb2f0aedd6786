use crate::can::{Frame, Identifier, CAN_EFF_MASK, CAN_MAX_DLEN, CAN_SFF_MASK};
use crate::mcba::constants::{
    Command, Controller, DLC_MASK, DLC_RTR_MASK, MESSAGE_SIZE, SIDL_EXID_MASK,
};
use crate::mcba::error::Error;
use crate::mcba::state::FirmwareVersion;

// CAN message layout

// byte 0
//   unsigned char cmd_id;

// byte 1, 2 (big endian)
//   EIDH | EIDL
//   15-8 | 7-0

// byte 3, 4 (big endian)
//   standard: SIDH   | SIDL
//             10 - 3 | 2 1 0 x x x x x
//   extended: SIDH    | SIDL
//             28 - 21 | 20 19 18 x EXIDE x 17 16

// byte 5
//   unsigned char reserved : 1;
//   unsigned char rtr : 1;
//   unsigned char reserved : 2;
//   unsigned char dlc : 4;

// byte 6
//   unsigned char data[8];

// byte 14
//   unsigned char timestamp[4];

// byte 18
//   unsigned char checksum;

fn pack_id(id: Identifier) -> (u16, u16) {
    match id {
        Identifier::Standard(id) => (((id & CAN_SFF_MASK) << 5) as u16, 0),
        Identifier::Extended(id) => {
            let id = id & CAN_EFF_MASK;
            let sid = SIDL_EXID_MASK as u32 | ((id & 0x1ffc0000) >> 13) | ((id & 0x30000) >> 16);
            (sid as u16, (id & 0xffff) as u16)
        }
    }
}

fn unpack_id(sid: u16, eid: u16) -> Identifier {
    let sid = sid as u32;
    if sid & SIDL_EXID_MASK as u32 != 0 {
        Identifier::Extended(((sid & 0xffe0) << 13) | ((sid & 0x3) << 16) | eid as u32)
    } else {
        Identifier::Standard((sid & 0xffe0) >> 5)
    }
}

fn check_length(buf: &[u8]) -> Result<(), Error> {
    if buf.len() != MESSAGE_SIZE {
        return Err(Error::MessageLength(buf.len()));
    }
    Ok(())
}

/// CAN frame as exchanged with the device, both for transmit and receive.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CanMessage {
    pub id: Identifier,
    pub rtr: bool,
    pub dlc: u8,
    pub data: [u8; CAN_MAX_DLEN],
    /// Opaque device timestamp, zero on transmit
    pub timestamp: [u8; 4],
}

impl CanMessage {
    pub fn new(
        id: Identifier,
        rtr: bool,
        dlc: u8,
        data: [u8; CAN_MAX_DLEN],
    ) -> Result<Self, Error> {
        if dlc as usize > CAN_MAX_DLEN {
            return Err(Error::InvalidDlc(dlc));
        }

        Ok(CanMessage {
            id,
            rtr,
            dlc,
            data,
            timestamp: [0; 4],
        })
    }

    /// Number of payload bytes this message carries on the bus.
    pub fn len(&self) -> usize {
        match self.rtr {
            true => 0,
            // Fields are public, a hand-built message may carry any dlc
            false => (self.dlc as usize).min(CAN_MAX_DLEN),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(&self, buf: &mut [u8; MESSAGE_SIZE]) {
        let (sid, eid) = pack_id(self.id);
        buf[1..3].copy_from_slice(&eid.to_be_bytes());
        buf[3..5].copy_from_slice(&sid.to_be_bytes());

        buf[5] = self.dlc & DLC_MASK;
        if self.rtr {
            buf[5] |= DLC_RTR_MASK;
        }

        buf[6..14].copy_from_slice(&self.data);
        buf[14..18].copy_from_slice(&self.timestamp);
    }

    fn read(buf: &[u8]) -> Result<Self, Error> {
        let eid = u16::from_be_bytes([buf[1], buf[2]]);
        let sid = u16::from_be_bytes([buf[3], buf[4]]);

        // The DLC is used as a copy length, so it has to be checked first
        let dlc = buf[5] & DLC_MASK;
        if dlc as usize > CAN_MAX_DLEN {
            return Err(Error::InvalidDlc(dlc));
        }
        let rtr = buf[5] & DLC_RTR_MASK != 0;

        let mut data = [0u8; CAN_MAX_DLEN];
        if !rtr {
            data[..dlc as usize].copy_from_slice(&buf[6..6 + dlc as usize]);
        }

        let mut timestamp = [0u8; 4];
        timestamp.copy_from_slice(&buf[14..18]);

        Ok(CanMessage {
            id: unpack_id(sid, eid),
            rtr,
            dlc,
            data,
            timestamp,
        })
    }

    /// Encode as a transmit request for the device.
    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        Message::Transmit(*self).encode()
    }

    /// Decode a transmit or receive record.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        match Message::decode(buf)? {
            Message::Receive(msg) | Message::Transmit(msg) => Ok(msg),
            other => Err(Error::UnexpectedCommand(other.command() as u8)),
        }
    }
}

impl TryFrom<&Frame> for CanMessage {
    type Error = crate::error::Error;
    fn try_from(frame: &Frame) -> Result<Self, Self::Error> {
        if frame.data.len() > CAN_MAX_DLEN || !frame.id.is_valid() {
            return Err(crate::error::Error::MalformedFrame);
        }

        let mut data = [0u8; CAN_MAX_DLEN];
        data[..frame.data.len()].copy_from_slice(&frame.data);

        let dlc = match frame.rtr {
            true => frame.dlc,
            false => frame.data.len() as u8,
        };

        CanMessage::new(frame.id, frame.rtr, dlc, data)
            .map_err(|_| crate::error::Error::MalformedFrame)
    }
}

impl From<&CanMessage> for Frame {
    fn from(msg: &CanMessage) -> Frame {
        Frame {
            id: msg.id,
            rtr: msg.rtr,
            dlc: msg.dlc,
            data: msg.data[..msg.len()].to_vec(),
            loopback: false,
        }
    }
}

/// Status report from the USB-side controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeepAliveUsb {
    pub termination: bool,
    pub version: FirmwareVersion,
}

/// Status report from the CAN-side controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct KeepAliveCan {
    pub tx_err_cnt: u8,
    pub rx_err_cnt: u8,
    pub rx_buff_ovfl: u8,
    pub tx_bus_off: bool,
    /// Bitrate the firmware runs at, in kbps
    pub can_bitrate: u16,
    pub rx_lost: u16,
    pub can_stat: u8,
    pub version: FirmwareVersion,
    pub debug_mode: u8,
    pub test_complete: u8,
    pub test_result: u8,
}

/// A single protocol message. All variants share the same fixed size on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Message {
    /// CAN frame received from the bus
    Receive(CanMessage),
    /// CAN frame to send on the bus
    Transmit(CanMessage),
    AliveFromUsb(KeepAliveUsb),
    AliveFromCan(KeepAliveCan),
    /// Requested bitrate in kbps
    ChangeBitrate(u16),
    ReadFirmwareVersion(Controller),
    SetTermination(bool),
    /// Transmission confirmation carrying a timestamp
    TransmitResponse,
    /// PIC_CAN telling PIC_USB it has nothing to send
    NothingToSend,
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Receive(_) => Command::ReceiveMessage,
            Message::Transmit(_) => Command::TransmitMessage,
            Message::AliveFromUsb(_) => Command::AliveFromUsb,
            Message::AliveFromCan(_) => Command::AliveFromCan,
            Message::ChangeBitrate(_) => Command::ChangeBitrate,
            Message::ReadFirmwareVersion(_) => Command::ReadFirmwareVersion,
            Message::SetTermination(_) => Command::SetupTerminationResistance,
            Message::TransmitResponse => Command::TransmitMessageResponse,
            Message::NothingToSend => Command::NothingToSend,
        }
    }

    /// Encode into a zero-filled record. Fields not used by the command stay zero.
    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0u8; MESSAGE_SIZE];
        buf[0] = self.command() as u8;

        match self {
            Message::Receive(msg) | Message::Transmit(msg) => msg.write(&mut buf),
            Message::AliveFromUsb(ka) => {
                buf[1] = ka.termination as u8;
                buf[2] = ka.version.major;
                buf[3] = ka.version.minor;
            }
            Message::AliveFromCan(ka) => {
                buf[1] = ka.tx_err_cnt;
                buf[2] = ka.rx_err_cnt;
                buf[3] = ka.rx_buff_ovfl;
                buf[4] = ka.tx_bus_off as u8;
                buf[5..7].copy_from_slice(&ka.can_bitrate.to_be_bytes());
                buf[7..9].copy_from_slice(&ka.rx_lost.to_be_bytes());
                buf[9] = ka.can_stat;
                buf[10] = ka.version.major;
                buf[11] = ka.version.minor;
                buf[12] = ka.debug_mode;
                buf[13] = ka.test_complete;
                buf[14] = ka.test_result;
            }
            Message::ChangeBitrate(bitrate) => {
                buf[1..3].copy_from_slice(&bitrate.to_be_bytes());
            }
            Message::ReadFirmwareVersion(controller) => buf[1] = *controller as u8,
            Message::SetTermination(enabled) => buf[1] = *enabled as u8,
            Message::TransmitResponse | Message::NothingToSend => {}
        }

        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Message, Error> {
        check_length(buf)?;

        let command = Command::from_repr(buf[0]).ok_or(Error::UnknownCommand(buf[0]))?;
        let msg = match command {
            Command::ReceiveMessage => Message::Receive(CanMessage::read(buf)?),
            Command::TransmitMessage => Message::Transmit(CanMessage::read(buf)?),
            Command::AliveFromUsb => Message::AliveFromUsb(KeepAliveUsb {
                termination: buf[1] != 0,
                version: FirmwareVersion::new(buf[2], buf[3]),
            }),
            Command::AliveFromCan => Message::AliveFromCan(KeepAliveCan {
                tx_err_cnt: buf[1],
                rx_err_cnt: buf[2],
                rx_buff_ovfl: buf[3],
                tx_bus_off: buf[4] != 0,
                can_bitrate: u16::from_be_bytes([buf[5], buf[6]]),
                rx_lost: u16::from_be_bytes([buf[7], buf[8]]),
                can_stat: buf[9],
                version: FirmwareVersion::new(buf[10], buf[11]),
                debug_mode: buf[12],
                test_complete: buf[13],
                test_result: buf[14],
            }),
            Command::ChangeBitrate => Message::ChangeBitrate(u16::from_be_bytes([buf[1], buf[2]])),
            Command::ReadFirmwareVersion => Message::ReadFirmwareVersion(
                Controller::from_repr(buf[1]).ok_or(Error::InvalidController(buf[1]))?,
            ),
            Command::SetupTerminationResistance => Message::SetTermination(buf[1] != 0),
            Command::TransmitMessageResponse => Message::TransmitResponse,
            Command::NothingToSend => Message::NothingToSend,
        };

        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(bytes: &[u8]) -> [u8; CAN_MAX_DLEN] {
        let mut data = [0u8; CAN_MAX_DLEN];
        data[..bytes.len()].copy_from_slice(bytes);
        data
    }

    #[test]
    fn test_pack_standard() {
        let msg =
            CanMessage::new(Identifier::Standard(0x123), false, 2, data(&[0xaa, 0xbb])).unwrap();
        let buf = msg.encode();

        assert_eq!(
            buf,
            [0xa3, 0x00, 0x00, 0x24, 0x60, 0x02, 0xaa, 0xbb, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_pack_extended() {
        let msg = CanMessage::new(Identifier::Extended(0x18da10f1), false, 0, [0; 8]).unwrap();
        let buf = msg.encode();

        // 0x18da10f1: bits 28-18 = 0x636, bits 17-16 = 0b10, bits 15-0 = 0x10f1
        assert_eq!(&buf[1..3], &[0x10, 0xf1]);
        assert_eq!(&buf[3..5], &[0xc6, 0xca]);
        assert_eq!(buf[5], 0);
    }

    #[test]
    fn test_unpack_receive() {
        let buf = [
            0xe3, 0x00, 0x00, 0x24, 0x60, 0x03, 0x01, 0x02, 0x03, 0xff, 0xff, 0xff, 0xff, 0xff,
            0x11, 0x22, 0x33, 0x44, 0x00,
        ];
        let msg = Message::decode(&buf).unwrap();

        let Message::Receive(msg) = msg else {
            panic!("Expected receive message, got {:?}", msg);
        };
        assert_eq!(msg.id, Identifier::Standard(0x123));
        assert_eq!(msg.dlc, 3);
        // Bytes past the DLC are not copied
        assert_eq!(msg.data, [1, 2, 3, 0, 0, 0, 0, 0]);
        assert_eq!(msg.timestamp, [0x11, 0x22, 0x33, 0x44]);

        let frame: Frame = (&msg).into();
        assert_eq!(frame.data, vec![1, 2, 3]);
    }

    #[test]
    fn test_round_trip_standard_ids() {
        for id in 0..=CAN_SFF_MASK {
            let msg = CanMessage::new(Identifier::Standard(id), false, 0, [0; 8]).unwrap();
            let decoded = CanMessage::decode(&msg.encode()).unwrap();
            assert_eq!(decoded.id, Identifier::Standard(id));
        }
    }

    #[test]
    fn test_round_trip_extended_ids() {
        let mut ids: Vec<u32> = (0..=CAN_EFF_MASK).step_by(7919).collect();
        ids.extend([0, 1, 0x7ff, 0x800, 0xffff, 0x10000, 0x30000, 0x3ffff, 0x40000, CAN_EFF_MASK]);

        for id in ids {
            let msg = CanMessage::new(Identifier::Extended(id), false, 0, [0; 8]).unwrap();
            let decoded = CanMessage::decode(&msg.encode()).unwrap();
            assert_eq!(decoded.id, Identifier::Extended(id));
        }
    }

    #[test]
    fn test_round_trip_dlc_and_payload() {
        let payload = [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04];
        for dlc in 0..=8u8 {
            let msg = CanMessage::new(
                Identifier::Standard(0x7ff),
                false,
                dlc,
                data(&payload[..dlc as usize]),
            )
            .unwrap();
            let decoded = CanMessage::decode(&msg.encode()).unwrap();

            assert_eq!(decoded.dlc, dlc);
            assert_eq!(&decoded.data[..dlc as usize], &payload[..dlc as usize]);
            assert_eq!(Frame::from(&decoded).data, payload[..dlc as usize].to_vec());
        }
    }

    #[test]
    fn test_round_trip_rtr() {
        for id in [Identifier::Standard(0x42), Identifier::Extended(0x42)] {
            for dlc in [0, 3, 8] {
                for rtr in [false, true] {
                    let msg = CanMessage::new(id, rtr, dlc, [0; 8]).unwrap();
                    let decoded = CanMessage::decode(&msg.encode()).unwrap();
                    assert_eq!(decoded.rtr, rtr);
                    assert_eq!(decoded.id, id);
                    assert_eq!(decoded.dlc, dlc);
                }
            }
        }
    }

    #[test]
    fn test_rtr_frame_has_no_payload() {
        let frame = Frame::new_remote(Identifier::Standard(0x100), 8).unwrap();
        let msg = CanMessage::try_from(&frame).unwrap();
        let buf = msg.encode();
        assert_eq!(buf[5], DLC_RTR_MASK | 8);

        let decoded = CanMessage::decode(&buf).unwrap();
        assert_eq!(decoded.len(), 0);
        assert_eq!(Frame::from(&decoded), frame);
    }

    #[test]
    fn test_malformed_dlc() {
        assert_eq!(
            CanMessage::new(Identifier::Standard(0x123), false, 9, [0; 8]),
            Err(Error::InvalidDlc(9))
        );

        let mut buf = [0u8; MESSAGE_SIZE];
        buf[0] = Command::ReceiveMessage as u8;
        buf[5] = 0x0f;
        assert_eq!(Message::decode(&buf), Err(Error::InvalidDlc(15)));

        // RTR bit does not count towards the length
        buf[5] = DLC_RTR_MASK | 0x09;
        assert_eq!(Message::decode(&buf), Err(Error::InvalidDlc(9)));
    }

    #[test]
    fn test_malformed_frame() {
        let frame = Frame {
            id: Identifier::Standard(0x123),
            rtr: false,
            dlc: 9,
            data: vec![0; 9],
            loopback: false,
        };
        assert_eq!(
            CanMessage::try_from(&frame),
            Err(crate::error::Error::MalformedFrame)
        );
    }

    #[test]
    fn test_wrong_length() {
        assert_eq!(Message::decode(&[0xff; 18]), Err(Error::MessageLength(18)));
        assert_eq!(Message::decode(&[0xff; 20]), Err(Error::MessageLength(20)));
    }

    #[test]
    fn test_unknown_command() {
        let mut buf = [0u8; MESSAGE_SIZE];
        buf[0] = 0x42;
        assert_eq!(Message::decode(&buf), Err(Error::UnknownCommand(0x42)));
    }

    #[test]
    fn test_keep_alive_can() {
        let buf = [
            0xf5, 3, 1, 0, 0, 0x01, 0xf4, 0x01, 0x02, 0x00, 2, 6, 0, 1, 1, 0, 0, 0, 0,
        ];
        let Ok(Message::AliveFromCan(ka)) = Message::decode(&buf) else {
            panic!("Expected CAN keep-alive");
        };

        assert_eq!(ka.tx_err_cnt, 3);
        assert_eq!(ka.rx_err_cnt, 1);
        assert!(!ka.tx_bus_off);
        assert_eq!(ka.can_bitrate, 500);
        assert_eq!(ka.rx_lost, 0x0102);
        assert_eq!(ka.version, FirmwareVersion::new(2, 6));
        assert_eq!(ka.test_complete, 1);

        assert_eq!(Message::AliveFromCan(ka).encode(), buf);
    }

    #[test]
    fn test_keep_alive_usb() {
        let mut buf = [0u8; MESSAGE_SIZE];
        buf[..4].copy_from_slice(&[0xf7, 1, 2, 8]);

        assert_eq!(
            Message::decode(&buf),
            Ok(Message::AliveFromUsb(KeepAliveUsb {
                termination: true,
                version: FirmwareVersion::new(2, 8),
            }))
        );
    }

    #[test]
    fn test_commands_zero_filled() {
        let buf = Message::ChangeBitrate(1000).encode();
        assert_eq!(buf[..3], [0xa1, 0x03, 0xe8]);
        assert!(buf[3..].iter().all(|&b| b == 0));

        let buf = Message::ReadFirmwareVersion(Controller::Can).encode();
        assert_eq!(buf[..2], [0xa9, 0x02]);
        assert!(buf[2..].iter().all(|&b| b == 0));

        let buf = Message::SetTermination(true).encode();
        assert_eq!(buf[..2], [0xa8, 0x01]);
        assert!(buf[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_invalid_controller() {
        let mut buf = [0u8; MESSAGE_SIZE];
        buf[0] = Command::ReadFirmwareVersion as u8;
        buf[1] = 7;
        assert_eq!(Message::decode(&buf), Err(Error::InvalidController(7)));
    }

    #[test]
    fn test_decode_rejects_other_commands() {
        let buf = Message::NothingToSend.encode();
        assert_eq!(CanMessage::decode(&buf), Err(Error::UnexpectedCommand(0xff)));
    }

    #[test]
    fn test_hand_built_dlc_clamped() {
        let msg = CanMessage {
            id: Identifier::Standard(0x10),
            rtr: false,
            dlc: 12,
            data: [7; CAN_MAX_DLEN],
            timestamp: [0; 4],
        };
        assert_eq!(msg.len(), CAN_MAX_DLEN);

        let frame = Frame::from(&msg);
        assert_eq!(frame.data, vec![7; CAN_MAX_DLEN]);
    }
}
