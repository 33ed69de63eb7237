//! Output buffers
//!
//! Pipe readers append raw bytes to a shared buffer while the supervisor
//! consumes them incrementally. Consumed bytes are dropped from the buffer.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

/// Byte buffer shared between a pipe reader task and its consumer
#[derive(Clone, Default)]
pub struct OutputBuffer {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    /// Creates an empty output buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the pipe
    pub fn push(&self, bytes: &[u8]) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.extend_from_slice(bytes);
    }

    /// Returns the text appended since the last read
    ///
    /// A multi-byte character split across reads is held back until it is
    /// complete.
    pub fn read_new(&mut self) -> String {
        self.read(false)
    }

    /// Returns everything not read yet, including an incomplete trailing character
    pub fn read_rest(&mut self) -> String {
        self.read(true)
    }

    /// Number of bytes waiting to be read
    pub fn pending_len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn read(&mut self, flush: bool) -> String {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);

        let end = match std::str::from_utf8(&buffer) {
            Ok(_) => buffer.len(),
            Err(e) if e.error_len().is_none() && !flush => e.valid_up_to(),
            Err(_) => buffer.len(),
        };

        let chunk = String::from_utf8_lossy(&buffer[..end]).into_owned();
        buffer.drain(..end);
        chunk
    }
}

/// Spawns a task copying `reader` into `sink` until EOF
pub fn spawn_reader<R>(mut reader: R, sink: OutputBuffer) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => sink.push(&chunk[..n]),
                Err(e) => {
                    tracing::debug!("Pipe read failed: {}", e);
                    break;
                }
            }
        }
    })
}
