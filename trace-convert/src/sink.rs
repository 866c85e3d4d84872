//! Per-thread output sinks.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

/// Append-only byte sink for one thread's trace, with a hook invoked at
/// chunk boundaries so seekable-archive backends can start a new entry.
/// Plain streams ignore the hook; the chunk-footer markers in the record
/// stream are enough for sequential readers.
pub trait ChunkSink: Write {
    fn begin_chunk(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Wraps any writer as a single-stream sink.
#[derive(Debug)]
pub struct StreamSink<W>(pub W);

impl<W: Write> Write for StreamSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> ChunkSink for StreamSink<W> {}

/// In-memory sink that keeps each chunk separate. Cloning shares the
/// underlying storage, so a caller can hand one clone to the converter and
/// inspect the chunks through another.
#[derive(Debug, Clone)]
pub struct MemorySink {
    chunks: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            chunks: Arc::new(Mutex::new(vec![Vec::new()])),
        }
    }

    pub fn chunks(&self) -> Vec<Vec<u8>> {
        match self.chunks.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut chunks = self
            .chunks
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "sink poisoned"))?;
        match chunks.last_mut() {
            Some(chunk) => chunk.extend_from_slice(buf),
            None => chunks.push(buf.to_vec()),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ChunkSink for MemorySink {
    fn begin_chunk(&mut self) -> io::Result<()> {
        self.chunks
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "sink poisoned"))?
            .push(Vec::new());
        Ok(())
    }
}
