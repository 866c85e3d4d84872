//! Self-describing trace records consumed by analysis tools.
//!
//! Every record is a fixed twelve bytes, little-endian:
//!
//! `| type: u16 | size: u16 | addr: u64 |`
//!
//! The `size` field is overloaded per record type: instruction length for
//! instruction records, access size for memory references, byte count for
//! encoding records, and the marker kind for markers.

use std::io::{self, Write};

/// Size in bytes of every trace record.
pub const TRACE_RECORD_SIZE: usize = 12;

/// Maximum instruction-encoding bytes carried by one `Encoding` record;
/// longer encodings continue in the immediately following records.
pub const ENCODING_BYTES_PER_RECORD: usize = 8;

#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error("unknown trace record type {0:#06x}")]
    UnknownType(u16),

    #[error("unknown trace marker kind {0:#06x}")]
    UnknownMarker(u16),

    #[error("truncated trace record ({0} trailing bytes)")]
    Truncated(usize),
}

/// Enumeration of record types (the `type` field).
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RecordType {
    Header = 0x0001,
    Pid = 0x0002,
    Tid = 0x0003,
    ThreadExit = 0x0004,
    Footer = 0x0005,
    Instr = 0x0010,
    InstrDirectJump = 0x0011,
    InstrIndirectJump = 0x0012,
    InstrConditionalJump = 0x0013,
    InstrTakenJump = 0x0014,
    InstrUntakenJump = 0x0015,
    InstrDirectCall = 0x0016,
    InstrIndirectCall = 0x0017,
    InstrReturn = 0x0018,
    InstrSysenter = 0x0019,
    MemRead = 0x0020,
    MemWrite = 0x0021,
    Prefetch = 0x0022,
    Flush = 0x0023,
    Encoding = 0x0030,
    Marker = 0x0040,
}

impl TryFrom<u16> for RecordType {
    type Error = RecordError;

    fn try_from(value: u16) -> Result<Self, RecordError> {
        Ok(match value {
            0x0001 => Self::Header,
            0x0002 => Self::Pid,
            0x0003 => Self::Tid,
            0x0004 => Self::ThreadExit,
            0x0005 => Self::Footer,
            0x0010 => Self::Instr,
            0x0011 => Self::InstrDirectJump,
            0x0012 => Self::InstrIndirectJump,
            0x0013 => Self::InstrConditionalJump,
            0x0014 => Self::InstrTakenJump,
            0x0015 => Self::InstrUntakenJump,
            0x0016 => Self::InstrDirectCall,
            0x0017 => Self::InstrIndirectCall,
            0x0018 => Self::InstrReturn,
            0x0019 => Self::InstrSysenter,
            0x0020 => Self::MemRead,
            0x0021 => Self::MemWrite,
            0x0022 => Self::Prefetch,
            0x0023 => Self::Flush,
            0x0030 => Self::Encoding,
            0x0040 => Self::Marker,
            n => return Err(RecordError::UnknownType(n)),
        })
    }
}

/// Control-flow category of an instruction record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum InstrKind {
    /// Straight-line instruction.
    Plain,
    DirectJump,
    IndirectJump,
    /// Conditional branch whose outcome is not (yet) known.
    ConditionalJump,
    TakenJump,
    UntakenJump,
    DirectCall,
    IndirectCall,
    Return,
    /// System call entry instruction.
    Sysenter,
}

impl InstrKind {
    fn record_type(self) -> RecordType {
        match self {
            Self::Plain => RecordType::Instr,
            Self::DirectJump => RecordType::InstrDirectJump,
            Self::IndirectJump => RecordType::InstrIndirectJump,
            Self::ConditionalJump => RecordType::InstrConditionalJump,
            Self::TakenJump => RecordType::InstrTakenJump,
            Self::UntakenJump => RecordType::InstrUntakenJump,
            Self::DirectCall => RecordType::InstrDirectCall,
            Self::IndirectCall => RecordType::InstrIndirectCall,
            Self::Return => RecordType::InstrReturn,
            Self::Sysenter => RecordType::InstrSysenter,
        }
    }

    /// Whether this is any kind of control transfer.
    pub fn is_branch(self) -> bool {
        !matches!(self, Self::Plain | Self::Sysenter)
    }
}

/// Kind of a memory-reference record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemrefKind {
    Read,
    Write,
    Prefetch,
    Flush,
}

impl MemrefKind {
    fn record_type(self) -> RecordType {
        match self {
            Self::Read => RecordType::MemRead,
            Self::Write => RecordType::MemWrite,
            Self::Prefetch => RecordType::Prefetch,
            Self::Flush => RecordType::Flush,
        }
    }
}

/// Kinds of marker records (the `size` field of a `Marker` record).
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TraceMarker {
    Timestamp = 0x0001,
    CpuId = 0x0002,
    KernelEvent = 0x0003,
    RseqEntry = 0x0004,
    RseqAbort = 0x0005,
    Syscall = 0x0006,
    MaybeBlockingSyscall = 0x0007,
    SyscallTraceStart = 0x0008,
    SyscallTraceEnd = 0x0009,
    SyscallFailed = 0x000a,
    ChunkInstrCount = 0x000b,
    ChunkFooter = 0x000c,
    RecordOrdinal = 0x000d,
    WindowId = 0x000e,
}

impl TryFrom<u16> for TraceMarker {
    type Error = RecordError;

    fn try_from(value: u16) -> Result<Self, RecordError> {
        Ok(match value {
            0x0001 => Self::Timestamp,
            0x0002 => Self::CpuId,
            0x0003 => Self::KernelEvent,
            0x0004 => Self::RseqEntry,
            0x0005 => Self::RseqAbort,
            0x0006 => Self::Syscall,
            0x0007 => Self::MaybeBlockingSyscall,
            0x0008 => Self::SyscallTraceStart,
            0x0009 => Self::SyscallTraceEnd,
            0x000a => Self::SyscallFailed,
            0x000b => Self::ChunkInstrCount,
            0x000c => Self::ChunkFooter,
            0x000d => Self::RecordOrdinal,
            0x000e => Self::WindowId,
            n => return Err(RecordError::UnknownMarker(n)),
        })
    }
}

/// A parsed trace record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TraceRecord {
    Header { version: u16, file_type: u32 },
    Pid(u64),
    Tid(u64),
    ThreadExit(u64),
    Footer,
    Instr { kind: InstrKind, length: u16, pc: u64 },
    Memref { kind: MemrefKind, size: u16, addr: u64 },
    Encoding { length: u16, bytes: [u8; ENCODING_BYTES_PER_RECORD] },
    Marker { kind: TraceMarker, value: u64 },
}

impl TraceRecord {
    /// Returns the wire `type` field for this record.
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Header { .. } => RecordType::Header,
            Self::Pid(_) => RecordType::Pid,
            Self::Tid(_) => RecordType::Tid,
            Self::ThreadExit(_) => RecordType::ThreadExit,
            Self::Footer => RecordType::Footer,
            Self::Instr { kind, .. } => kind.record_type(),
            Self::Memref { kind, .. } => kind.record_type(),
            Self::Encoding { .. } => RecordType::Encoding,
            Self::Marker { .. } => RecordType::Marker,
        }
    }

    /// Whether this record represents a retired instruction fetch.
    pub fn is_instr(&self) -> bool {
        matches!(self, Self::Instr { .. })
    }

    /// The fetch PC, for instruction records.
    pub fn instr_pc(&self) -> Option<u64> {
        match self {
            Self::Instr { pc, .. } => Some(*pc),
            _ => None,
        }
    }

    /// Parses one fixed-size record.
    pub fn parse(bytes: [u8; TRACE_RECORD_SIZE]) -> Result<Self, RecordError> {
        let ty = u16::from_le_bytes([bytes[0], bytes[1]]);
        let size = u16::from_le_bytes([bytes[2], bytes[3]]);
        let addr = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
        Ok(match RecordType::try_from(ty)? {
            RecordType::Header => Self::Header {
                version: size,
                file_type: addr as u32,
            },
            RecordType::Pid => Self::Pid(addr),
            RecordType::Tid => Self::Tid(addr),
            RecordType::ThreadExit => Self::ThreadExit(addr),
            RecordType::Footer => Self::Footer,
            RecordType::Instr => Self::instr(InstrKind::Plain, size, addr),
            RecordType::InstrDirectJump => Self::instr(InstrKind::DirectJump, size, addr),
            RecordType::InstrIndirectJump => Self::instr(InstrKind::IndirectJump, size, addr),
            RecordType::InstrConditionalJump => Self::instr(InstrKind::ConditionalJump, size, addr),
            RecordType::InstrTakenJump => Self::instr(InstrKind::TakenJump, size, addr),
            RecordType::InstrUntakenJump => Self::instr(InstrKind::UntakenJump, size, addr),
            RecordType::InstrDirectCall => Self::instr(InstrKind::DirectCall, size, addr),
            RecordType::InstrIndirectCall => Self::instr(InstrKind::IndirectCall, size, addr),
            RecordType::InstrReturn => Self::instr(InstrKind::Return, size, addr),
            RecordType::InstrSysenter => Self::instr(InstrKind::Sysenter, size, addr),
            RecordType::MemRead => Self::memref(MemrefKind::Read, size, addr),
            RecordType::MemWrite => Self::memref(MemrefKind::Write, size, addr),
            RecordType::Prefetch => Self::memref(MemrefKind::Prefetch, size, addr),
            RecordType::Flush => Self::memref(MemrefKind::Flush, size, addr),
            RecordType::Encoding => Self::Encoding {
                length: size,
                bytes: addr.to_le_bytes(),
            },
            RecordType::Marker => Self::Marker {
                kind: TraceMarker::try_from(size)?,
                value: addr,
            },
        })
    }

    fn instr(kind: InstrKind, length: u16, pc: u64) -> Self {
        Self::Instr { kind, length, pc }
    }

    fn memref(kind: MemrefKind, size: u16, addr: u64) -> Self {
        Self::Memref { kind, size, addr }
    }

    /// Serializes this record into the provided buffer.
    pub fn emit(&self, buffer: &mut Vec<u8>) {
        let (size, addr) = match *self {
            Self::Header { version, file_type } => (version, file_type as u64),
            Self::Pid(v) | Self::Tid(v) | Self::ThreadExit(v) => (0, v),
            Self::Footer => (0, 0),
            Self::Instr { length, pc, .. } => (length, pc),
            Self::Memref { size, addr, .. } => (size, addr),
            Self::Encoding { length, bytes } => (length, u64::from_le_bytes(bytes)),
            Self::Marker { kind, value } => (kind as u16, value),
        };
        buffer.extend_from_slice(&(self.record_type() as u16).to_le_bytes());
        buffer.extend_from_slice(&size.to_le_bytes());
        buffer.extend_from_slice(&addr.to_le_bytes());
    }
}

/// Splits an instruction's raw bytes into the `Encoding` records that carry
/// them, in wire order.
pub fn encoding_records(bytes: &[u8]) -> impl Iterator<Item = TraceRecord> + '_ {
    bytes.chunks(ENCODING_BYTES_PER_RECORD).map(|chunk| {
        let mut payload = [0u8; ENCODING_BYTES_PER_RECORD];
        payload[..chunk.len()].copy_from_slice(chunk);
        TraceRecord::Encoding {
            length: chunk.len() as u16,
            bytes: payload,
        }
    })
}

/// Buffered record writer over any byte sink.
#[derive(Debug)]
pub struct TraceWriter<W> {
    out: W,
    buffer: Vec<u8>,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            buffer: Vec::with_capacity(TRACE_RECORD_SIZE),
        }
    }

    pub fn write(&mut self, record: &TraceRecord) -> io::Result<()> {
        self.buffer.clear();
        record.emit(&mut self.buffer);
        self.out.write_all(&self.buffer)
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.out
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Iterator over the records in a serialized trace buffer.
#[derive(Debug, Copy, Clone)]
pub struct RecordIter<'d> {
    bytes: &'d [u8],
}

impl<'d> RecordIter<'d> {
    pub fn new(bytes: &'d [u8]) -> Self {
        Self { bytes }
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Result<TraceRecord, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.is_empty() {
            return None;
        }
        if self.bytes.len() < TRACE_RECORD_SIZE {
            let trailing = self.bytes.len();
            self.bytes = &[];
            return Some(Err(RecordError::Truncated(trailing)));
        }
        let (head, rest) = self.bytes.split_at(TRACE_RECORD_SIZE);
        self.bytes = rest;
        Some(TraceRecord::parse(head.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: TraceRecord) -> TraceRecord {
        let mut buffer = Vec::new();
        record.emit(&mut buffer);
        assert_eq!(buffer.len(), TRACE_RECORD_SIZE);
        TraceRecord::parse(buffer.try_into().unwrap()).unwrap()
    }

    #[test]
    fn records_roundtrip() {
        let records = [
            TraceRecord::Header {
                version: 3,
                file_type: 1,
            },
            TraceRecord::Tid(42),
            TraceRecord::Instr {
                kind: InstrKind::TakenJump,
                length: 2,
                pc: 0x40_1000,
            },
            TraceRecord::Memref {
                kind: MemrefKind::Write,
                size: 8,
                addr: 0x7fff_0000_0010,
            },
            TraceRecord::Marker {
                kind: TraceMarker::Syscall,
                value: 228,
            },
            TraceRecord::Footer,
        ];
        for record in records {
            assert_eq!(roundtrip(record), record);
        }
    }

    #[test]
    fn long_encodings_split_across_records() {
        let bytes: Vec<u8> = (0..11).collect();
        let records: Vec<_> = encoding_records(&bytes).collect();
        assert_eq!(records.len(), 2);
        let TraceRecord::Encoding { length, bytes: head } = records[0] else {
            panic!("expected encoding record");
        };
        assert_eq!(length, 8);
        assert_eq!(&head[..], &[0, 1, 2, 3, 4, 5, 6, 7]);
        let TraceRecord::Encoding { length, bytes: tail } = records[1] else {
            panic!("expected encoding record");
        };
        assert_eq!(length, 3);
        assert_eq!(&tail[..3], &[8, 9, 10]);
    }

    #[test]
    fn iter_reports_truncation() {
        let mut buffer = Vec::new();
        TraceRecord::Footer.emit(&mut buffer);
        buffer.extend_from_slice(&[0u8; 5]);
        let mut iter = RecordIter::new(&buffer);
        assert!(matches!(iter.next(), Some(Ok(TraceRecord::Footer))));
        assert!(matches!(iter.next(), Some(Err(RecordError::Truncated(5)))));
        assert!(iter.next().is_none());
    }
}
