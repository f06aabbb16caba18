//! Line-level serial transport.
//!
//! [`Transport`] wraps a [`Port`] with the read semantics the protocol
//! engines rely on: counted reads whose deadline is re-armed whenever bytes
//! arrive, burst reads that drain a quiet window, buffered line reassembly,
//! and a nested read-timeout override stack.
//!
//! Every operation that needs a non-default timeout goes through
//! [`Transport::with_timeout`], which restores the previous value on all
//! exit paths.

use crate::error::{Error, Result};
use crate::port::Port;
use log::trace;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Default read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Default linking timeout.
pub const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-operation retry count.
pub const DEFAULT_RETRY_COUNT: u32 = 10;

/// Serial transport with timeout-stack semantics.
pub struct Transport<P: Port> {
    port: P,
    read_timeout: Duration,
    link_timeout: Duration,
    retry_count: u32,
    timeout_stack: Vec<Duration>,
}

impl<P: Port> Transport<P> {
    /// Wrap a port with default timings.
    pub fn new(port: P) -> Self {
        Self {
            port,
            read_timeout: DEFAULT_READ_TIMEOUT,
            link_timeout: DEFAULT_LINK_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
            timeout_stack: Vec::new(),
        }
    }

    /// Set the base read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the linking timeout.
    #[must_use]
    pub fn with_link_timeout(mut self, timeout: Duration) -> Self {
        self.link_timeout = timeout;
        self
    }

    /// Set the retry count used by chunked operations.
    #[must_use]
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Change the base read timeout in place.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Change the linking timeout in place.
    pub fn set_link_timeout(&mut self, timeout: Duration) {
        self.link_timeout = timeout;
    }

    /// Change the retry count in place.
    pub fn set_retry_count(&mut self, retry_count: u32) {
        self.retry_count = retry_count;
    }

    /// Borrow the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Mutably borrow the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the transport and return the port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Current read timeout.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Linking timeout.
    pub fn link_timeout(&self) -> Duration {
        self.link_timeout
    }

    /// Retry count for chunked operations.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Change the port baud rate (closes and reopens the device).
    pub fn set_baud(&mut self, baud_rate: u32) -> Result<()> {
        self.port.set_baud_rate(baud_rate)
    }

    /// Current port baud rate.
    pub fn baud(&self) -> u32 {
        self.port.baud_rate()
    }

    /// Write all bytes and flush the output path.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read exactly `count` bytes.
    ///
    /// The deadline is re-armed every time bytes arrive; receiving fewer
    /// than `count` bytes within the final window is a
    /// [`Error::LinkTimeout`], which callers decide to retry or not.
    pub fn read_exact(&mut self, count: usize) -> Result<Vec<u8>> {
        let data = self.read_internal(Some(count))?;
        if data.len() < count {
            return Err(Error::LinkTimeout(format!(
                "read({count}): only {} bytes received",
                data.len()
            )));
        }
        Ok(data)
    }

    /// Read up to `count` bytes; at least one byte must arrive.
    pub fn read_max(&mut self, count: usize) -> Result<Vec<u8>> {
        self.read_internal(Some(count))
    }

    /// Read whatever arrives until a full timeout window passes in silence.
    pub fn read_burst(&mut self) -> Result<Vec<u8>> {
        self.read_internal(None)
    }

    fn read_internal(&mut self, count: Option<usize>) -> Result<Vec<u8>> {
        self.port.set_timeout(self.read_timeout)?;
        let mut response = Vec::new();
        let mut buf = [0u8; 4096];
        let mut deadline = Instant::now() + self.read_timeout;

        while Instant::now() < deadline {
            let want = match count {
                Some(count) => {
                    let left = count - response.len();
                    if left == 0 {
                        break;
                    }
                    left.min(buf.len())
                },
                None => buf.len(),
            };
            match self.port.read(&mut buf[..want]) {
                Ok(0) => {},
                Ok(n) => {
                    response.extend_from_slice(&buf[..n]);
                    deadline = Instant::now() + self.read_timeout;
                },
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }

        if response.is_empty() {
            return Err(Error::LinkTimeout("read: no data received".into()));
        }
        Ok(response)
    }

    /// Iterate over newline-terminated lines until the stream goes quiet.
    ///
    /// Partial final fragments are buffered across reads; blank lines are
    /// skipped. The iterator ends with a single [`Error::LinkTimeout`] item
    /// once no more data arrives.
    pub fn read_lines(&mut self) -> Lines<'_, P> {
        Lines {
            transport: self,
            pending: Vec::new(),
            buffer: Vec::new(),
            done: false,
        }
    }

    /// Discard pending input and flush the output path.
    pub fn flush(&mut self) -> Result<()> {
        self.port.clear_buffers()?;
        self.port.flush()?;
        Ok(())
    }

    /// Override the read timeout, keeping the previous value on a stack.
    pub fn push_timeout(&mut self, timeout: Duration) {
        trace!("push_timeout({timeout:?})");
        self.timeout_stack.push(self.read_timeout);
        self.read_timeout = timeout;
    }

    /// Restore the read timeout saved by the matching [`Self::push_timeout`].
    pub fn pop_timeout(&mut self) {
        trace!("pop_timeout()");
        if let Some(timeout) = self.timeout_stack.pop() {
            self.read_timeout = timeout;
        }
    }

    /// Run `f` under a temporary read timeout, restoring the previous value
    /// on every exit path.
    pub fn with_timeout<T, F>(&mut self, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        self.push_timeout(timeout);
        let result = f(self);
        self.pop_timeout();
        result
    }

    /// Drain the input until the chip stops sending bytes for `quiet`.
    pub fn timed_flush(&mut self, quiet: Duration) -> Result<()> {
        self.push_timeout(quiet);
        let result = self.read_burst();
        self.pop_timeout();
        match result {
            Ok(_) | Err(Error::LinkTimeout(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Iterator returned by [`Transport::read_lines`].
pub struct Lines<'a, P: Port> {
    transport: &'a mut Transport<P>,
    pending: Vec<String>,
    buffer: Vec<u8>,
    done: bool,
}

impl<P: Port> Iterator for Lines<'_, P> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.pending.pop() {
                return Some(Ok(line));
            }
            if self.done {
                return None;
            }
            match self.transport.read_burst() {
                Ok(read) => {
                    self.buffer.extend_from_slice(&read);
                    let mut lines: Vec<String> = Vec::new();
                    while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                        let rest = self.buffer.split_off(pos + 1);
                        let line = std::mem::replace(&mut self.buffer, rest);
                        let line = String::from_utf8_lossy(&line).trim().to_string();
                        if !line.is_empty() {
                            lines.push(line);
                        }
                    }
                    lines.reverse();
                    self.pending = lines;
                },
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                },
            }
        }
    }
}
