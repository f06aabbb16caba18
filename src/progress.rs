//! Progress reporting and cooperative cancellation.
//!
//! Long-running transfers report byte counts and status messages through
//! [`FlashProgress`] and poll [`FlashProgress::should_cancel`] between
//! chunks (never mid-chunk). Cancellation surfaces as
//! [`Error::Cancelled`](crate::Error::Cancelled), which is an outcome, not
//! a protocol failure.

/// Progress and cancellation surface consumed by the flashing engines.
///
/// All methods have no-op defaults, so callers only implement what they
/// display.
pub trait FlashProgress {
    /// Total byte count of the operation, reported once it is known.
    fn on_total(&mut self, _total: usize) {}

    /// A chunk of `bytes` completed.
    fn on_update(&mut self, _bytes: usize) {}

    /// Human-readable status line ("Linking...", "OTA 1 (0x011000)").
    fn on_message(&mut self, _message: &str) {}

    /// Polled between chunks; returning `true` stops the operation.
    fn should_cancel(&self) -> bool {
        false
    }
}

/// Progress sink that discards everything and never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl FlashProgress for NoProgress {}
