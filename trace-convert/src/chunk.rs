//! Chunked record output with per-chunk encoding tracking.
//!
//! A thread's trace is cut into bounded-instruction-count chunks so a
//! compressed archive can be entered at any chunk without replaying the ones
//! before it. The writer owns the emitted-encoding set: membership is scoped
//! to the current chunk, so clearing it at a boundary makes the engine
//! re-emit any encoding the next chunk needs.

use std::io::{self, Write};

use trace_format::record::{TraceMarker, TraceRecord, TraceWriter};

use crate::seen::AddressSet;
use crate::sink::ChunkSink;

pub(crate) struct ChunkWriter {
    writer: TraceWriter<Box<dyn ChunkSink + Send>>,
    emitted: AddressSet,
    limit: u64,
    chunk_instrs: u64,
    total_instrs: u64,
    total_records: u64,
    chunk_ordinal: u64,
}

impl ChunkWriter {
    pub fn new(sink: Box<dyn ChunkSink + Send>, limit: u64) -> Self {
        Self {
            writer: TraceWriter::new(sink),
            emitted: AddressSet::new(),
            limit: limit.max(1),
            chunk_instrs: 0,
            total_instrs: 0,
            total_records: 0,
            chunk_ordinal: 0,
        }
    }

    pub fn write(&mut self, record: &TraceRecord) -> io::Result<()> {
        self.writer.write(record)?;
        self.total_records += 1;
        if record.is_instr() {
            self.chunk_instrs += 1;
            self.total_instrs += 1;
        }
        Ok(())
    }

    /// True once the current chunk is full. Checked only between blocks:
    /// a chunk boundary never falls inside a block.
    pub fn should_split(&self) -> bool {
        self.chunk_instrs >= self.limit
    }

    /// Closes the current chunk and opens the next one.
    ///
    /// The old chunk ends with its footer marker; the new one opens with the
    /// record ordinal (for seek indexing) and the thread's current timestamp
    /// and CPU so the chunk carries its own scheduling context. Clearing the
    /// emitted set makes every encoding the new chunk touches get re-emitted.
    pub fn split(&mut self, last_timestamp: u64, last_cpu: u64) -> io::Result<()> {
        self.write(&TraceRecord::Marker {
            kind: TraceMarker::ChunkFooter,
            value: self.chunk_ordinal,
        })?;
        self.writer.get_mut().begin_chunk()?;
        self.chunk_ordinal += 1;
        self.chunk_instrs = 0;
        self.emitted.clear();
        tracing::trace!(chunk = self.chunk_ordinal, "opened output chunk");
        self.write(&TraceRecord::Marker {
            kind: TraceMarker::RecordOrdinal,
            value: self.total_records,
        })?;
        self.write(&TraceRecord::Marker {
            kind: TraceMarker::Timestamp,
            value: last_timestamp,
        })?;
        self.write(&TraceRecord::Marker {
            kind: TraceMarker::CpuId,
            value: last_cpu,
        })
    }

    /// Whether `pc`'s encoding still has to be written in this chunk; marks
    /// it written.
    pub fn needs_encoding(&mut self, pc: u64) -> bool {
        self.emitted.insert(pc)
    }

    /// Forgets an emission whose records were rolled back.
    pub fn rollback_encoding(&mut self, pc: u64) {
        self.emitted.remove(pc);
    }

    /// Pushes buffered bytes through to the sink. Buffering sinks only
    /// surface write failures here, so skipping this loses the tail of the
    /// trace silently.
    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.get_mut().flush()
    }

    pub fn total_instrs(&self) -> u64 {
        self.total_instrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use trace_format::record::InstrKind;

    fn instr(pc: u64) -> TraceRecord {
        TraceRecord::Instr {
            kind: InstrKind::Plain,
            length: 1,
            pc,
        }
    }

    #[test]
    fn split_starts_a_new_sink_chunk() {
        let sink = MemorySink::new();
        let mut writer = ChunkWriter::new(Box::new(sink.clone()), 2);
        writer.write(&instr(0x10)).unwrap();
        assert!(!writer.should_split());
        writer.write(&instr(0x11)).unwrap();
        assert!(writer.should_split());
        writer.split(123, 4).unwrap();
        assert!(!writer.should_split());
        writer.write(&instr(0x12)).unwrap();
        assert_eq!(writer.total_instrs(), 3);
        assert_eq!(sink.chunks().len(), 2);
    }

    #[test]
    fn encodings_reset_at_chunk_boundaries() {
        let sink = MemorySink::new();
        let mut writer = ChunkWriter::new(Box::new(sink), 1);
        assert!(writer.needs_encoding(0x40));
        assert!(!writer.needs_encoding(0x40));
        writer.split(0, 0).unwrap();
        assert!(writer.needs_encoding(0x40));
        writer.rollback_encoding(0x40);
        assert!(writer.needs_encoding(0x40));
    }
}
