//! Fixed-capacity pool of transmit contexts.
//!
//! Each outstanding bulk-out transfer owns one slot. The slot index is also
//! the echo id handed to the frame sink, so a slot is never reused before the
//! transfer referencing it has completed.

/// What an outstanding transfer carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxPayload {
    /// A CAN frame with `len` payload bytes, acknowledged to the sink on completion
    Frame { len: usize },
    /// A bare device command
    Command,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TxContext {
    pub slot: usize,
    pub payload: TxPayload,
}

impl TxContext {
    pub fn is_frame(&self) -> bool {
        matches!(self.payload, TxPayload::Frame { .. })
    }
}

/// Result of releasing a slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Released {
    pub context: TxContext,
    /// An earlier acquire failed and this release made room again
    pub resumed: bool,
}

pub struct TxContextPool<const N: usize> {
    slots: [Option<TxContext>; N],
    stalled: bool,
}

impl<const N: usize> Default for TxContextPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> TxContextPool<N> {
    pub const fn new() -> Self {
        Self {
            slots: [None; N],
            stalled: false,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Take the lowest free slot.
    ///
    /// Returns `None` when every slot is in flight. The caller then has to
    /// stop producing until a release reports `resumed`.
    pub fn acquire(&mut self, payload: TxPayload) -> Option<TxContext> {
        match self.slots.iter().position(|s| s.is_none()) {
            Some(slot) => {
                let context = TxContext { slot, payload };
                self.slots[slot] = Some(context);
                Some(context)
            }
            None => {
                self.stalled = true;
                None
            }
        }
    }

    /// Free a slot. Releasing a slot that is not in flight is a no-op.
    pub fn release(&mut self, slot: usize) -> Option<Released> {
        let context = self.slots.get_mut(slot)?.take()?;
        let resumed = std::mem::replace(&mut self.stalled, false);

        Some(Released { context, resumed })
    }

    pub fn get(&self, slot: usize) -> Option<&TxContext> {
        self.slots.get(slot)?.as_ref()
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_exhausted(&self) -> bool {
        self.slots.iter().all(|s| s.is_some())
    }

    pub fn is_idle(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }
}
