//! Wire formats shared between the runtime instrumenter, the offline
//! converter, and analysis tools.
//!
//! Two formats live here:
//!
//! - [`raw`]: the compact per-thread entries the instrumenter writes while the
//!   target runs. Entries are a fixed eight bytes and omit anything the
//!   converter can reconstruct from the traced binaries (elided memory
//!   addresses, instruction encodings, implicit branch targets).
//! - [`record`]: the self-describing records analysis tools consume. Records
//!   are a fixed twelve bytes and carry everything needed to replay execution
//!   without access to the original binaries.

pub mod raw;
pub mod record;

pub use raw::{RawEntry, RawMarker, RawReader};
pub use record::{InstrKind, MemrefKind, TraceMarker, TraceRecord, TraceWriter};

/// Version stamped into raw headers and output header records.
pub const TRACE_FORMAT_VERSION: u16 = 3;

bitflags::bitflags! {
    /// Properties of a whole trace file, carried in the header.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct FileType: u32 {
        /// Instruction encodings are interleaved with instruction records.
        const ENCODINGS = 1 << 0;
        /// The file is a syscall template collection, not an execution trace.
        const SYSCALL_TEMPLATES = 1 << 1;
        /// Kernel-mode sub-traces are present for some syscalls.
        const KERNEL_SYSCALLS = 1 << 2;
        /// Some kernel sub-traces were decoded best-effort and may contain
        /// bounded PC discontinuities.
        const KERNEL_SYSCALLS_DEGRADED = 1 << 3;
    }
}
