//! Port abstraction for serial communication.
//!
//! The protocol layers are written against the [`Port`] trait so they can be
//! driven by the native `serialport` implementation or by scripted ports in
//! tests.

pub mod native;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

pub use native::{NativePort, list_ports};

/// Byte-stream port with timeout, baud-rate and modem-line control.
///
/// `read` implementations return either `Ok(0)` or an
/// [`std::io::ErrorKind::TimedOut`] error when nothing arrives within the
/// configured timeout; [`Transport`](crate::transport::Transport) treats the
/// two uniformly.
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current read timeout.
    fn timeout(&self) -> Duration;

    /// Change the baud rate.
    ///
    /// Implementations close and reopen the underlying device at the new
    /// rate; several boot ROMs only latch a rate change on a clean reopen.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard buffered input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Port name/path.
    fn name(&self) -> &str;

    /// Set DTR (Data Terminal Ready) line state.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set RTS (Request To Send) line state.
    fn set_rts(&mut self, level: bool) -> Result<()>;
}
