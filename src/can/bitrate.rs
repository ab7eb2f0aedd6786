//! Helpers for describing CAN bit timing.
//!
//! Adapters with firmware-fixed timing only accept a target bitrate, but the
//! segments behind it are still useful for diagnostics. [`BitTiming`] takes
//! the segment values and a prescaler and derives:
//! - the time quantum in nanoseconds
//! - the resulting `bitrate`
//! - the sample point in tenths of a percent

/// Bit timing parameters together with the values derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BitTiming {
    pub sjw: u32,
    pub prop_seg: u32,
    pub phase_seg1: u32,
    pub phase_seg2: u32,
    /// Bit-rate prescaler
    pub brp: u32,
    /// Time quantum in nanoseconds.
    pub tq_ns: u32,
    /// Bitrate in bits per second.
    pub bitrate: u32,
    /// Sample point in one-tenth of a percent (`875` is 87.5%).
    pub sample_point: u32,
}

impl BitTiming {
    /// Derive bitrate and sample point from the segments.
    ///
    /// ```rust
    /// use mcba::can::bitrate::BitTiming;
    ///
    /// let bt = BitTiming::from_segments(40_000_000, 1, 3, 8, 8, 4);
    /// assert_eq!(bt.tq_ns, 100);
    /// assert_eq!(bt.bitrate, 500_000);
    /// assert_eq!(bt.sample_point, 600);
    /// ```
    pub const fn from_segments(
        clock_hz: u32,
        sjw: u32,
        prop_seg: u32,
        phase_seg1: u32,
        phase_seg2: u32,
        brp: u32,
    ) -> Self {
        let tq_ns = (brp * 1000) / (clock_hz / 1_000_000);
        let bit_time_tq = sjw + prop_seg + phase_seg1 + phase_seg2;

        BitTiming {
            sjw,
            prop_seg,
            phase_seg1,
            phase_seg2,
            brp,
            tq_ns,
            bitrate: 1_000_000_000 / (bit_time_tq * tq_ns),
            sample_point: ((sjw + prop_seg + phase_seg1) * 1000) / bit_time_tq,
        }
    }

    /// Duration of one bit in time quanta.
    pub fn bit_time_tq(&self) -> u32 {
        self.sjw + self.prop_seg + self.phase_seg1 + self.phase_seg2
    }

    /// Sample point in normalized form (`0.0..1.0`).
    pub fn sample_point_ratio(&self) -> f64 {
        self.sample_point as f64 / 1000.0
    }
}
