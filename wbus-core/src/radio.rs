//! Thin seam to the physical LoRa link (spec.md §4.3). The concrete
//! RYLR998 AT-command driver lives in the firmware crates; this crate
//! only names the interface the Sender and Receiver engines need.

use heapless::Vec;

use crate::packet::MAX_WIRE_LEN;

/// A decoded (but not yet decrypted) frame pulled off the air, with the
/// signal-quality figures the module reports alongside it.
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub data: Vec<u8, MAX_WIRE_LEN>,
    pub rssi_dbm: i16,
    pub snr_db: i16,
}

/// Cooperative, single-threaded, non-blocking radio interface.
///
/// `send` must return with the transceiver back in receive mode — a
/// driver that leaves it in a standby/idle state after transmit would
/// silently miss the acknowledgement that follows (spec.md §4.3, §8).
pub trait RadioLink {
    type Error;

    fn send(&mut self, frame: &[u8]) -> Result<(), Self::Error>;

    /// Non-blocking; at most one frame per call. Frames outside the valid
    /// size window are discarded by the driver, not returned here.
    fn try_recv(&mut self) -> Result<Option<RxFrame>, Self::Error>;

    fn sleep(&mut self);
    fn receive(&mut self);
    fn idle(&mut self);
}
