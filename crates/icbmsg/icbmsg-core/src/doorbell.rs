//! Notification towards the peer core.
//!
//! The instance rings after every packet it enqueues. What ringing means is up
//! to the platform: an IPC interrupt, a mailbox write, or nothing at all when
//! the peer polls.

pub trait Doorbell {
    fn ring(&self);
}

/// For peers that poll instead of waiting for an interrupt.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDoorbell;

impl Doorbell for NoDoorbell {
    #[inline]
    fn ring(&self) {}
}

impl<F: Fn()> Doorbell for F {
    #[inline]
    fn ring(&self) {
        self()
    }
}
