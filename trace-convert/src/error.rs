use trace_format::raw::RawError;
use trace_format::record::RecordError;

/// Errors surfaced while converting raw streams.
///
/// A `ConvertError` returned from a per-thread conversion is fatal to that
/// thread only; sibling threads on other workers keep running. Degraded but
/// survivable conditions (missing syscall template, partial kernel decode)
/// are counted in [`crate::stats`] instead of raised here.
#[derive(thiserror::Error, Debug)]
pub enum ConvertError {
    #[error(transparent)]
    Raw(#[from] RawError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error("malformed raw header: {0}")]
    MalformedHeader(String),

    #[error("corrupt raw stream: {0}")]
    CorruptStream(String),

    #[error("module {modidx} offset {modoffs:#x} is not mapped")]
    UnmappedModule { modidx: u32, modoffs: u64 },

    #[error("cannot decode instruction at {pc:#x}: {reason}")]
    Decode { pc: u64, reason: String },

    #[error("syscall template source: {0}")]
    Template(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("worker thread panicked")]
    WorkerPanic,
}
