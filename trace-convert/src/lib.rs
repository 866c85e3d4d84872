//! Converts raw per-thread instrumentation streams into self-describing
//! trace records.
//!
//! The raw format (see the `trace-format` crate) omits everything a
//! post-processing pass can reconstruct from the traced binaries: elided
//! memory addresses, instruction encodings, implicit branch targets. This
//! crate is that pass. A [`Converter`] partitions thread streams over a
//! fixed pool of workers; each worker drives a per-thread state machine that
//! re-decodes code blocks through a memoized cache, reconstructs elided
//! addresses by replaying base-register reuse, rolls back aborted
//! restartable sequences, injects kernel-side syscall traces, and cuts the
//! output into independently decodable chunks.
//!
//! ```no_run
//! use std::sync::Arc;
//! use trace_convert::{ConvertConfig, Converter, ThreadInput};
//! use trace_convert::modmap::InMemoryMapper;
//! use trace_convert::sink::StreamSink;
//! use trace_convert::x86::X86Decoder;
//!
//! # fn run() -> Result<(), trace_convert::error::ConvertError> {
//! let mut mapper = InMemoryMapper::new();
//! mapper.insert(0, 0x40_0000, 0x1000);
//! let mut decoder = X86Decoder::new();
//! decoder.add_segment(0x40_0000, std::fs::read("binary.bin")?);
//!
//! let converter = Converter::new(Arc::new(mapper), Arc::new(decoder), ConvertConfig::default());
//! let inputs = vec![ThreadInput {
//!     tid: 1234,
//!     input: Box::new(std::fs::File::open("1234.raw")?),
//!     sink: Box::new(StreamSink(std::fs::File::create("1234.trace")?)),
//! }];
//! let output = converter.convert(inputs)?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
mod chunk;
pub mod decode;
mod engine;
pub mod error;
pub mod modmap;
mod rseq;
pub mod sched;
mod seen;
pub mod sink;
pub mod stats;
pub mod syscall;
pub mod x86;

use std::io::Read;
use std::sync::Arc;

use tracing::{debug, trace_span};

pub use error::ConvertError;
pub use stats::Statistic;

use cache::BlockCache;
use decode::{InstructionDecoder, ModuleMapper};
use engine::ThreadConverter;
use sched::ScheduleAggregator;
use sink::ChunkSink;
use stats::GlobalStats;
use syscall::{KernelTraceDecoder, SyscallTemplates};

/// Instructions per output chunk unless configured otherwise.
pub const DEFAULT_CHUNK_INSTR_COUNT: u64 = 10_000_000;

#[derive(Debug, Clone)]
pub struct ConvertConfig {
    /// Worker threads; thread streams are partitioned round-robin over them.
    pub worker_count: usize,
    pub chunk_instr_count: u64,
    /// Accept partially decoded kernel captures instead of discarding them.
    pub best_effort: bool,
    /// PC discontinuities tolerated per non-fatal kernel decode error.
    pub max_discontinuities_per_error: u64,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            worker_count: parallelism.min(16),
            chunk_instr_count: DEFAULT_CHUNK_INSTR_COUNT,
            best_effort: false,
            max_discontinuities_per_error: 1,
        }
    }
}

/// One thread's raw stream and where its records go.
pub struct ThreadInput {
    pub tid: u64,
    pub input: Box<dyn Read + Send>,
    pub sink: Box<dyn ChunkSink + Send>,
}

/// Aggregated results of a completed conversion.
pub struct ConvertOutput {
    stats: GlobalStats,
    pub schedule: ScheduleAggregator,
}

impl ConvertOutput {
    pub fn get_statistic(&self, statistic: Statistic) -> u64 {
        self.stats.get(statistic)
    }
}

/// Drives the conversion of a set of thread streams.
///
/// The mapper, decoder, and syscall sources are shared read-only across
/// workers; all mutable state is per thread and owned by exactly one worker.
pub struct Converter {
    mapper: Arc<dyn ModuleMapper>,
    decoder: Arc<dyn InstructionDecoder>,
    templates: Option<Arc<SyscallTemplates>>,
    kernel: Option<Arc<dyn KernelTraceDecoder>>,
    config: ConvertConfig,
}

impl Converter {
    pub fn new(
        mapper: Arc<dyn ModuleMapper>,
        decoder: Arc<dyn InstructionDecoder>,
        config: ConvertConfig,
    ) -> Self {
        Self {
            mapper,
            decoder,
            templates: None,
            kernel: None,
            config,
        }
    }

    pub fn with_templates(mut self, templates: Arc<SyscallTemplates>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn with_kernel_decoder(mut self, kernel: Arc<dyn KernelTraceDecoder>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Converts every input to completion and merges the per-thread results.
    ///
    /// A fatal error on one worker aborts that worker's remaining threads;
    /// the other workers run to completion behind the join barrier, and the
    /// first fatal error is reported with the partial results discarded.
    pub fn convert(&self, inputs: Vec<ThreadInput>) -> Result<ConvertOutput, ConvertError> {
        let worker_count = self.config.worker_count.clamp(1, inputs.len().max(1));
        let mut buckets: Vec<Vec<ThreadInput>> = (0..worker_count).map(|_| Vec::new()).collect();
        for (index, input) in inputs.into_iter().enumerate() {
            buckets[index % worker_count].push(input);
        }

        let mut handles = Vec::with_capacity(worker_count);
        for (worker_id, bucket) in buckets.into_iter().enumerate() {
            let mapper = Arc::clone(&self.mapper);
            let decoder = Arc::clone(&self.decoder);
            let templates = self.templates.clone();
            let kernel = self.kernel.clone();
            let config = self.config.clone();
            handles.push(std::thread::spawn(move || {
                let _span = trace_span!("worker", id = worker_id).entered();
                let mut cache = BlockCache::new();
                let mut outcomes = Vec::with_capacity(bucket.len());
                for input in bucket {
                    let _thread = trace_span!("thread", tid = input.tid).entered();
                    let converter = ThreadConverter::new(
                        input.input,
                        input.sink,
                        &*mapper,
                        &*decoder,
                        templates.as_deref(),
                        kernel.as_deref(),
                        &config,
                        &mut cache,
                    );
                    let outcome = converter.run()?;
                    debug!(
                        tid = outcome.tid,
                        instrs = outcome.stats.final_instr_count,
                        "thread converted"
                    );
                    outcomes.push(outcome);
                }
                cache.clear();
                Ok::<_, ConvertError>(outcomes)
            }));
        }

        let mut stats = GlobalStats::default();
        let mut schedule = ScheduleAggregator::default();
        let mut first_error = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(outcomes)) => {
                    for outcome in outcomes {
                        stats.merge(&outcome.stats);
                        schedule.extend(outcome.samples);
                    }
                }
                Ok(Err(error)) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                Err(_) => {
                    if first_error.is_none() {
                        first_error = Some(ConvertError::WorkerPanic);
                    }
                }
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(ConvertOutput { stats, schedule }),
        }
    }
}
