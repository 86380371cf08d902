use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle shared by the client, transport contexts and frames.
///
/// Public operations check for [`Lifecycle::Active`] on entry and fail with
/// [`RtspError::Closed`](crate::RtspError::Closed) otherwise. Resources are
/// released while `Closing`, then the state becomes `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    Closing,
    Closed,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Closing => 1,
            Self::Closed => 2,
        }
    }
}

/// A [`Lifecycle`] readable from any thread.
#[derive(Debug)]
pub struct SharedLifecycle(AtomicU8);

impl SharedLifecycle {
    pub fn new() -> Self {
        SharedLifecycle(AtomicU8::new(Lifecycle::Active.as_u8()))
    }

    pub fn get(&self) -> Lifecycle {
        Lifecycle::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.get() == Lifecycle::Active
    }

    /// Move from `Active` to `Closing`. Returns false if already leaving.
    pub fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(
                Lifecycle::Active.as_u8(),
                Lifecycle::Closing.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn finish_close(&self) {
        self.0.store(Lifecycle::Closed.as_u8(), Ordering::SeqCst);
    }
}

impl Default for SharedLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
