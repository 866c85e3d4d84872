//! Raw entries written by the runtime instrumenter, one stream per traced
//! thread.
//!
//! Every entry is a little-endian `u64` whose top byte selects the kind:
//!
//! `| payload: 56 bits | kind: u8 |`
//!
//! Payload layouts per kind:
//!
//! - `Header`: `| version: u16 | file_type: u32 | unused: u8 |`
//! - `Block`: `| modoffs: u32 | modidx: u12 | instr_count: u12 |`
//! - `Marker`: `| value: u48 | marker kind: u8 |`
//! - everything else: a single 56-bit value.
//!
//! Marker payloads are limited to 48 bits. A wider value is split across two
//! consecutive entries: a [`RawMarker::ValueHi`] marker carrying the high bits
//! immediately precedes the marker carrying the low 48. Readers reassemble the
//! pair; [`RawReader::next_keep_prior`] and [`RawReader::unread_last`] exist so
//! a consumer can put both halves back when it reads past a boundary.

use std::collections::VecDeque;
use std::io::{BufReader, Read};

/// Size in bytes of every raw entry.
pub const RAW_ENTRY_SIZE: usize = 8;

/// Number of payload bits in a marker entry; wider values are split.
pub const MARKER_VALUE_BITS: u32 = 48;

const VALUE_MASK: u64 = (1u64 << 56) - 1;
const MARKER_VALUE_MASK: u64 = (1u64 << MARKER_VALUE_BITS) - 1;
const MODOFFS_BITS: u32 = 32;
const MODIDX_BITS: u32 = 12;
const INSTR_COUNT_BITS: u32 = 12;

#[derive(thiserror::Error, Debug)]
pub enum RawError {
    #[error("unknown raw entry kind {0:#04x}")]
    UnknownKind(u8),

    #[error("unknown raw marker kind {0:#04x}")]
    UnknownMarker(u8),

    #[error("truncated raw entry ({0} trailing bytes)")]
    Truncated(usize),

    #[error("block field out of range: {0}")]
    FieldRange(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Enumeration of raw entry kinds (the top byte of the entry).
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RawKind {
    Header = 0x01,
    Pid = 0x02,
    Tid = 0x03,
    Timestamp = 0x04,
    Block = 0x05,
    Memref = 0x06,
    Marker = 0x07,
    ThreadExit = 0x08,
    Footer = 0x09,
}

impl TryFrom<u8> for RawKind {
    type Error = RawError;

    #[inline]
    fn try_from(value: u8) -> Result<Self, RawError> {
        match value {
            0x01 => Ok(Self::Header),
            0x02 => Ok(Self::Pid),
            0x03 => Ok(Self::Tid),
            0x04 => Ok(Self::Timestamp),
            0x05 => Ok(Self::Block),
            0x06 => Ok(Self::Memref),
            0x07 => Ok(Self::Marker),
            0x08 => Ok(Self::ThreadExit),
            0x09 => Ok(Self::Footer),
            n => Err(RawError::UnknownKind(n)),
        }
    }
}

/// Kinds of raw marker entries.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RawMarker {
    /// Identifier of the CPU the following records executed on.
    CpuId = 0x01,
    /// A kernel transfer (signal, fault, rseq abort) at the payload PC.
    KernelEvent = 0x02,
    /// Entry into a restartable sequence; payload is the region end PC.
    RseqEntry = 0x03,
    /// Abort of the open restartable sequence at the payload PC.
    RseqAbort = 0x04,
    /// System call with the payload number was invoked.
    Syscall = 0x05,
    /// The prior syscall may block.
    MaybeBlockingSyscall = 0x06,
    /// High bits of a split marker value; always precedes its low half.
    ValueHi = 0x07,
    /// Tracing window identifier.
    WindowId = 0x08,
}

impl TryFrom<u8> for RawMarker {
    type Error = RawError;

    #[inline]
    fn try_from(value: u8) -> Result<Self, RawError> {
        match value {
            0x01 => Ok(Self::CpuId),
            0x02 => Ok(Self::KernelEvent),
            0x03 => Ok(Self::RseqEntry),
            0x04 => Ok(Self::RseqAbort),
            0x05 => Ok(Self::Syscall),
            0x06 => Ok(Self::MaybeBlockingSyscall),
            0x07 => Ok(Self::ValueHi),
            0x08 => Ok(Self::WindowId),
            n => Err(RawError::UnknownMarker(n)),
        }
    }
}

/// A parsed raw entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RawEntry {
    Header { version: u16, file_type: u32 },
    Pid(u64),
    Tid(u64),
    Timestamp(u64),
    Block { modidx: u32, modoffs: u64, instr_count: u16 },
    Memref { addr: u64 },
    Marker { kind: RawMarker, value: u64 },
    ThreadExit(u64),
    Footer,
}

impl RawEntry {
    /// Returns the corresponding [`RawKind`] for this entry.
    pub fn kind(&self) -> RawKind {
        match self {
            Self::Header { .. } => RawKind::Header,
            Self::Pid(_) => RawKind::Pid,
            Self::Tid(_) => RawKind::Tid,
            Self::Timestamp(_) => RawKind::Timestamp,
            Self::Block { .. } => RawKind::Block,
            Self::Memref { .. } => RawKind::Memref,
            Self::Marker { .. } => RawKind::Marker,
            Self::ThreadExit(_) => RawKind::ThreadExit,
            Self::Footer => RawKind::Footer,
        }
    }

    /// Parses one fixed-size entry.
    pub fn parse(bytes: [u8; RAW_ENTRY_SIZE]) -> Result<Self, RawError> {
        let word = u64::from_le_bytes(bytes);
        let payload = word & VALUE_MASK;
        match RawKind::try_from((word >> 56) as u8)? {
            RawKind::Header => Ok(Self::Header {
                version: payload as u16,
                file_type: (payload >> 16) as u32,
            }),
            RawKind::Pid => Ok(Self::Pid(payload)),
            RawKind::Tid => Ok(Self::Tid(payload)),
            RawKind::Timestamp => Ok(Self::Timestamp(payload)),
            RawKind::Block => Ok(Self::Block {
                modoffs: payload & ((1u64 << MODOFFS_BITS) - 1),
                modidx: ((payload >> MODOFFS_BITS) & ((1u64 << MODIDX_BITS) - 1)) as u32,
                instr_count: ((payload >> (MODOFFS_BITS + MODIDX_BITS))
                    & ((1u64 << INSTR_COUNT_BITS) - 1)) as u16,
            }),
            RawKind::Memref => Ok(Self::Memref { addr: payload }),
            RawKind::Marker => Ok(Self::Marker {
                kind: RawMarker::try_from((payload >> MARKER_VALUE_BITS) as u8)?,
                value: payload & MARKER_VALUE_MASK,
            }),
            RawKind::ThreadExit => Ok(Self::ThreadExit(payload)),
            RawKind::Footer => Ok(Self::Footer),
        }
    }

    /// Serializes this entry into the provided buffer.
    ///
    /// Fails if a field does not fit its packed width, which means the caller
    /// constructed an entry the wire format cannot represent.
    pub fn emit(&self, buffer: &mut Vec<u8>) -> Result<(), RawError> {
        let payload = match *self {
            Self::Header { version, file_type } => (version as u64) | ((file_type as u64) << 16),
            Self::Pid(v) | Self::Tid(v) | Self::Timestamp(v) | Self::ThreadExit(v) => {
                if v > VALUE_MASK {
                    return Err(RawError::FieldRange("value"));
                }
                v
            }
            Self::Block {
                modidx,
                modoffs,
                instr_count,
            } => {
                if modoffs >= 1u64 << MODOFFS_BITS {
                    return Err(RawError::FieldRange("modoffs"));
                }
                if modidx >= 1u32 << MODIDX_BITS {
                    return Err(RawError::FieldRange("modidx"));
                }
                if instr_count as u32 >= 1u32 << INSTR_COUNT_BITS {
                    return Err(RawError::FieldRange("instr_count"));
                }
                modoffs
                    | ((modidx as u64) << MODOFFS_BITS)
                    | ((instr_count as u64) << (MODOFFS_BITS + MODIDX_BITS))
            }
            Self::Memref { addr } => {
                if addr > VALUE_MASK {
                    return Err(RawError::FieldRange("addr"));
                }
                addr
            }
            Self::Marker { kind, value } => {
                if value > MARKER_VALUE_MASK {
                    return Err(RawError::FieldRange("marker value"));
                }
                value | ((kind as u64) << MARKER_VALUE_BITS)
            }
            Self::Footer => 0,
        };
        let word = payload | ((self.kind() as u64) << 56);
        buffer.extend_from_slice(&word.to_le_bytes());
        Ok(())
    }
}

/// Emits a marker, splitting the value across a [`RawMarker::ValueHi`] pair
/// when it exceeds the 48-bit marker payload.
pub fn emit_marker(kind: RawMarker, value: u64, buffer: &mut Vec<u8>) -> Result<(), RawError> {
    if value > MARKER_VALUE_MASK {
        RawEntry::Marker {
            kind: RawMarker::ValueHi,
            value: value >> MARKER_VALUE_BITS,
        }
        .emit(buffer)?;
    }
    RawEntry::Marker {
        kind,
        value: value & MARKER_VALUE_MASK,
    }
    .emit(buffer)
}

/// Buffered reader over one thread's raw stream with one level of pushback.
///
/// The converter needs to look ahead while reassembling split markers and
/// while deciding whether a pending record belongs to the current block;
/// `next_keep_prior` remembers the previous entry so `unread_last` can put
/// both back. `queue` appends synthesized entries behind the pushback slots.
#[derive(Debug)]
pub struct RawReader<R> {
    reader: BufReader<R>,
    pre_read: VecDeque<RawEntry>,
    last: Option<RawEntry>,
    prior: Option<RawEntry>,
}

impl<R: Read> RawReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pre_read: VecDeque::new(),
            last: None,
            prior: None,
        }
    }

    /// Returns the next entry, or `None` at a clean end of stream.
    pub fn next(&mut self) -> Result<Option<RawEntry>, RawError> {
        self.prior = None;
        self.advance()
    }

    /// Like [`next`](Self::next), but remembers the entry it replaces so a
    /// subsequent [`unread_last`](Self::unread_last) restores both.
    pub fn next_keep_prior(&mut self) -> Result<Option<RawEntry>, RawError> {
        self.prior = self.last;
        self.advance()
    }

    /// Pushes the most recently returned entry (and its remembered
    /// predecessor, if `next_keep_prior` was used) back onto the stream.
    pub fn unread_last(&mut self) {
        if let Some(entry) = self.last.take() {
            self.pre_read.push_front(entry);
        }
        if let Some(entry) = self.prior.take() {
            self.pre_read.push_front(entry);
        }
    }

    /// Returns the next entry without consuming it.
    pub fn peek(&mut self) -> Result<Option<RawEntry>, RawError> {
        if let Some(&entry) = self.pre_read.front() {
            return Ok(Some(entry));
        }
        match self.read_entry()? {
            Some(entry) => {
                self.pre_read.push_front(entry);
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Appends a synthesized entry behind any pushed-back entries.
    pub fn queue(&mut self, entry: RawEntry) {
        self.pre_read.push_back(entry);
    }

    fn advance(&mut self) -> Result<Option<RawEntry>, RawError> {
        let entry = match self.pre_read.pop_front() {
            Some(entry) => Some(entry),
            None => self.read_entry()?,
        };
        self.last = entry;
        Ok(entry)
    }

    fn read_entry(&mut self) -> Result<Option<RawEntry>, RawError> {
        let mut bytes = [0u8; RAW_ENTRY_SIZE];
        let mut filled = 0;
        while filled < RAW_ENTRY_SIZE {
            match self.reader.read(&mut bytes[filled..])? {
                0 if filled == 0 => return Ok(None),
                0 => return Err(RawError::Truncated(filled)),
                n => filled += n,
            }
        }
        RawEntry::parse(bytes).map(Some)
    }
}
