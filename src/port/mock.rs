//! Scripted in-memory port for protocol tests.

use crate::error::Result;
use crate::port::Port;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;

/// Observable side of a [`MockPort`]: everything the code under test did.
#[derive(Default)]
pub struct MockIo {
    /// Bytes queued for the next reads.
    pub read_buf: VecDeque<u8>,
    /// All bytes written, flattened.
    pub written: Vec<u8>,
    /// Number of `write` calls.
    pub write_calls: usize,
    /// Baud rates in the order they were set.
    pub baud_history: Vec<u32>,
    /// Current baud rate.
    pub baud_rate: u32,
    /// DTR transitions in order.
    pub dtr_history: Vec<bool>,
    /// RTS transitions in order.
    pub rts_history: Vec<bool>,
    /// Number of `clear_buffers` calls.
    pub cleared: usize,
}

type Responder = Box<dyn FnMut(&[u8], &mut MockIo) + Send>;

/// In-memory [`Port`] with a pre-seeded read queue and an optional
/// write-triggered responder, so stateful boot ROMs can be simulated.
pub struct MockPort {
    /// Recorded I/O state, inspectable after the test.
    pub io: MockIo,
    responder: Option<Responder>,
    timeout: Duration,
}

impl MockPort {
    /// Create a port with an empty read queue.
    pub fn new() -> Self {
        Self {
            io: MockIo {
                baud_rate: 115_200,
                ..MockIo::default()
            },
            responder: None,
            timeout: Duration::from_millis(10),
        }
    }

    /// Create a port that will answer reads with `response`.
    pub fn with_response(response: &[u8]) -> Self {
        let mut port = Self::new();
        port.io.read_buf.extend(response);
        port
    }

    /// Install a responder invoked with every written buffer; it may queue
    /// reply bytes into [`MockIo::read_buf`].
    pub fn on_write<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&[u8], &mut MockIo) + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Queue bytes for subsequent reads.
    pub fn push_read(&mut self, data: &[u8]) {
        self.io.read_buf.extend(data);
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.io.baud_rate = baud_rate;
        self.io.baud_history.push(baud_rate);
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.io.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.io.cleared += 1;
        self.io.read_buf.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.io.dtr_history.push(level);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.io.rts_history.push(level);
        Ok(())
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.io.read_buf.is_empty() {
            return Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.io.read_buf.len());
        for b in buf.iter_mut().take(n) {
            *b = self.io.read_buf.pop_front().expect("checked non-empty");
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.io.written.extend_from_slice(buf);
        self.io.write_calls += 1;
        if let Some(mut responder) = self.responder.take() {
            responder(buf, &mut self.io);
            self.responder = Some(responder);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
