//! Per-thread conversion state machine.
//!
//! One `ThreadConverter` owns everything needed to turn a single thread's
//! raw stream into trace records: the raw reader, the chunked output writer,
//! a borrowed per-worker block cache, the delayed-branch slot, the rseq
//! buffer, and the thread's statistics. It moves through
//! `ExpectHeader -> Steady -> ThreadEnd`; any error is fatal to this thread
//! only.

use std::io::Read;

use tracing::warn;

use trace_format::raw::{RawEntry, RawMarker, RawReader, MARKER_VALUE_BITS};
use trace_format::record::{encoding_records, InstrKind, TraceMarker, TraceRecord};
use trace_format::{FileType, TRACE_FORMAT_VERSION};

use crate::cache::BlockCache;
use crate::chunk::ChunkWriter;
use crate::decode::{BranchKind, InstrFlags, InstructionDecoder, InstrSummary, ModuleMapper, RegId};
use crate::error::ConvertError;
use crate::rseq::RseqBuffer;
use crate::sched::SchedSample;
use crate::sink::ChunkSink;
use crate::stats::ThreadStats;
use crate::syscall::{KernelTraceDecoder, SyscallTemplates};
use crate::ConvertConfig;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    ExpectHeader,
    Steady,
    ThreadEnd,
}

/// A branch held back so it stays adjacent to its target in the output.
///
/// The final branch of a block cannot be classified taken/untaken until the
/// next block's start address is known, so it (with its memory references)
/// waits here. Pass-through markers arriving in the meantime are queued
/// behind it. Flushed when the next block arrives, when a kernel event
/// resolves it, or unresolved at any other non-adjacent record.
struct DelayedBranch {
    pc: u64,
    length: u8,
    branch: BranchKind,
    target: Option<u64>,
    bytes: Vec<u8>,
    memrefs: Vec<TraceRecord>,
    trailing: Vec<TraceRecord>,
}

pub(crate) struct ThreadOutcome {
    pub tid: u64,
    pub stats: ThreadStats,
    pub samples: Vec<SchedSample>,
}

pub(crate) struct ThreadConverter<'a, R: Read> {
    reader: RawReader<R>,
    out: ChunkWriter,
    cache: &'a mut BlockCache,
    mapper: &'a dyn ModuleMapper,
    decoder: &'a dyn InstructionDecoder,
    templates: Option<&'a SyscallTemplates>,
    kernel: Option<&'a dyn KernelTraceDecoder>,
    config: &'a ConvertConfig,
    state: State,
    tid: u64,
    emit_encodings: bool,
    delayed: Option<DelayedBranch>,
    rseq: Option<RseqBuffer>,
    reg_vals: hashbrown::HashMap<RegId, u64>,
    last_timestamp: u64,
    last_cpu: u64,
    last_instr_syscall: bool,
    last_syscall: Option<u64>,
    instr_since_syscall: bool,
    dropped_last_syscall: bool,
    stats: ThreadStats,
    samples: Vec<SchedSample>,
}

impl<'a, R: Read> ThreadConverter<'a, R> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input: R,
        sink: Box<dyn ChunkSink + Send>,
        mapper: &'a dyn ModuleMapper,
        decoder: &'a dyn InstructionDecoder,
        templates: Option<&'a SyscallTemplates>,
        kernel: Option<&'a dyn KernelTraceDecoder>,
        config: &'a ConvertConfig,
        cache: &'a mut BlockCache,
    ) -> Self {
        Self {
            reader: RawReader::new(input),
            out: ChunkWriter::new(sink, config.chunk_instr_count),
            cache,
            mapper,
            decoder,
            templates,
            kernel,
            config,
            state: State::ExpectHeader,
            tid: 0,
            emit_encodings: false,
            delayed: None,
            rseq: None,
            reg_vals: hashbrown::HashMap::new(),
            last_timestamp: 0,
            last_cpu: 0,
            last_instr_syscall: false,
            last_syscall: None,
            instr_since_syscall: false,
            dropped_last_syscall: false,
            stats: ThreadStats::default(),
            samples: Vec::new(),
        }
    }

    pub fn run(mut self) -> Result<ThreadOutcome, ConvertError> {
        while self.state != State::ThreadEnd {
            let Some(entry) = self.reader.next()? else {
                return Err(ConvertError::CorruptStream(
                    "stream ended without a footer".into(),
                ));
            };
            match self.state {
                State::ExpectHeader => self.process_header(entry)?,
                State::Steady => self.dispatch(entry)?,
                State::ThreadEnd => {}
            }
        }
        Ok(ThreadOutcome {
            tid: self.tid,
            stats: self.stats,
            samples: self.samples,
        })
    }

    fn process_header(&mut self, entry: RawEntry) -> Result<(), ConvertError> {
        let RawEntry::Header { version, file_type } = entry else {
            return Err(ConvertError::MalformedHeader(format!(
                "stream starts with {:?}",
                entry.kind()
            )));
        };
        if version != TRACE_FORMAT_VERSION {
            return Err(ConvertError::MalformedHeader(format!(
                "version {version}, expected {TRACE_FORMAT_VERSION}"
            )));
        }
        let mut file_type = FileType::from_bits_truncate(file_type);
        self.emit_encodings = file_type.contains(FileType::ENCODINGS);
        if self.kernel.is_some() || self.templates.is_some() {
            file_type |= FileType::KERNEL_SYSCALLS;
        }
        if self.kernel.is_some() && self.config.best_effort {
            file_type |= FileType::KERNEL_SYSCALLS_DEGRADED;
        }
        self.out.write(&TraceRecord::Header {
            version,
            file_type: file_type.bits(),
        })?;
        self.out.write(&TraceRecord::Marker {
            kind: TraceMarker::ChunkInstrCount,
            value: self.config.chunk_instr_count,
        })?;
        self.state = State::Steady;
        Ok(())
    }

    fn dispatch(&mut self, entry: RawEntry) -> Result<(), ConvertError> {
        match entry {
            RawEntry::Header { .. } => {
                Err(ConvertError::CorruptStream("duplicate header".into()))
            }
            RawEntry::Tid(tid) => {
                self.tid = tid;
                self.emit_or_delay(TraceRecord::Tid(tid))
            }
            RawEntry::Pid(pid) => self.emit_or_delay(TraceRecord::Pid(pid)),
            RawEntry::Timestamp(value) => self.process_timestamp(value),
            RawEntry::Block {
                modidx,
                modoffs,
                instr_count,
            } => self.process_block(modidx, modoffs, instr_count),
            RawEntry::Memref { .. } => Err(ConvertError::CorruptStream(
                "memory reference outside a block".into(),
            )),
            RawEntry::Marker { kind, value } => self.process_marker(kind, value),
            RawEntry::ThreadExit(tid) => {
                self.flush_delayed(None)?;
                self.commit_rseq()?;
                self.emit(TraceRecord::ThreadExit(tid))
            }
            RawEntry::Footer => self.finish(),
        }
    }

    fn finish(&mut self) -> Result<(), ConvertError> {
        self.flush_delayed(None)?;
        self.commit_rseq()?;
        self.out.write(&TraceRecord::Footer)?;
        self.out.flush()?;
        self.stats.final_instr_count = self.out.total_instrs();
        self.state = State::ThreadEnd;
        Ok(())
    }

    /// Instruction ordinal of the next marker position in the output. A
    /// marker queued behind a pending delayed branch lands after that one
    /// extra instruction.
    fn marker_instr_ordinal(&self) -> u64 {
        self.out.total_instrs() + u64::from(self.delayed.is_some())
    }

    fn process_timestamp(&mut self, value: u64) -> Result<(), ConvertError> {
        self.stats.record_timestamp(value);
        self.last_timestamp = value;
        self.samples.push(SchedSample {
            tid: self.tid,
            cpu: self.last_cpu,
            timestamp: value,
            instr_ordinal: self.marker_instr_ordinal(),
        });
        self.emit_or_delay(TraceRecord::Marker {
            kind: TraceMarker::Timestamp,
            value,
        })
    }

    fn process_marker(&mut self, kind: RawMarker, value: u64) -> Result<(), ConvertError> {
        let (kind, value) = if kind == RawMarker::ValueHi {
            match self.reader.next()? {
                Some(RawEntry::Marker {
                    kind: low_kind,
                    value: low,
                }) if low_kind != RawMarker::ValueHi => {
                    (low_kind, (value << MARKER_VALUE_BITS) | low)
                }
                _ => {
                    return Err(ConvertError::CorruptStream(
                        "split marker missing its low half".into(),
                    ))
                }
            }
        } else {
            (kind, value)
        };
        match kind {
            RawMarker::CpuId => {
                self.last_cpu = value;
                self.samples.push(SchedSample {
                    tid: self.tid,
                    cpu: value,
                    timestamp: self.last_timestamp,
                    instr_ordinal: self.marker_instr_ordinal(),
                });
                self.emit_or_delay(TraceRecord::Marker {
                    kind: TraceMarker::CpuId,
                    value,
                })
            }
            RawMarker::KernelEvent => {
                self.flush_delayed(Some(value))?;
                if self.rseq.is_some() {
                    self.abort_rseq(value, TraceMarker::KernelEvent)
                } else {
                    self.emit(TraceRecord::Marker {
                        kind: TraceMarker::KernelEvent,
                        value,
                    })
                }
            }
            RawMarker::RseqEntry => {
                self.flush_delayed(None)?;
                self.commit_rseq()?;
                self.emit(TraceRecord::Marker {
                    kind: TraceMarker::RseqEntry,
                    value,
                })?;
                self.rseq = Some(RseqBuffer::new(value));
                Ok(())
            }
            RawMarker::RseqAbort => {
                self.flush_delayed(Some(value))?;
                if self.rseq.is_some() {
                    self.abort_rseq(value, TraceMarker::RseqAbort)
                } else {
                    self.emit(TraceRecord::Marker {
                        kind: TraceMarker::RseqAbort,
                        value,
                    })
                }
            }
            RawMarker::Syscall => self.process_syscall(value),
            RawMarker::MaybeBlockingSyscall => {
                if self.dropped_last_syscall {
                    Ok(())
                } else {
                    self.emit_or_delay(TraceRecord::Marker {
                        kind: TraceMarker::MaybeBlockingSyscall,
                        value,
                    })
                }
            }
            RawMarker::WindowId => self.emit_or_delay(TraceRecord::Marker {
                kind: TraceMarker::WindowId,
                value,
            }),
            RawMarker::ValueHi => Err(ConvertError::CorruptStream(
                "dangling marker high half".into(),
            )),
        }
    }

    fn process_block(
        &mut self,
        modidx: u32,
        modoffs: u64,
        instr_count: u16,
    ) -> Result<(), ConvertError> {
        let start = self.mapper.resolve(modidx, modoffs)?;
        self.flush_delayed(Some(start))?;
        // Reaching the region end commits the open sequence.
        if self.rseq.as_ref().is_some_and(|b| start == b.end_pc()) {
            self.commit_rseq()?;
        }
        if self.rseq.is_none() && self.out.should_split() {
            self.out.split(self.last_timestamp, self.last_cpu)?;
        }
        let block = self
            .cache
            .get_or_create(modidx, modoffs, start, instr_count, self.decoder)?;
        self.reg_vals.clear();
        let count = block.instrs.len();
        for (index, ins) in block.instrs.iter().enumerate() {
            let memrefs = self.reconstruct_memrefs(ins)?;
            self.last_instr_syscall = ins.flags.contains(InstrFlags::IS_SYSCALL);
            self.instr_since_syscall = true;
            let delay = index + 1 == count && self.rseq.is_none();
            if let (true, Some(branch)) = (delay, ins.branch) {
                self.delayed = Some(DelayedBranch {
                    pc: ins.pc,
                    length: ins.length,
                    branch,
                    target: ins.branch_target,
                    bytes: ins.bytes.clone(),
                    memrefs,
                    trailing: Vec::new(),
                });
                continue;
            }
            self.emit_instr(
                ins.instr_kind(),
                ins.pc,
                ins.length,
                &ins.bytes,
                ins.branch_target,
            )?;
            for memref in memrefs {
                self.emit(memref)?;
            }
        }
        Ok(())
    }

    /// Reconstructs the block instruction's memory operand addresses,
    /// consuming raw entries only for explicit ones.
    fn reconstruct_memrefs(
        &mut self,
        ins: &InstrSummary,
    ) -> Result<Vec<TraceRecord>, ConvertError> {
        let mut memrefs = Vec::with_capacity(ins.memrefs.len());
        let explicit_all = ins.flags.contains(InstrFlags::IS_SCATTER_GATHER);
        for operand in &ins.memrefs {
            let addr = if explicit_all || !operand.use_remembered_base {
                self.next_memref_addr()?
            } else if operand.pc_relative {
                self.stats.count_elided += 1;
                ins.pc
            } else {
                self.stats.count_elided += 1;
                let base = operand.base.ok_or_else(|| {
                    ConvertError::CorruptStream("elided operand without a base register".into())
                })?;
                self.reg_vals.get(&base).copied().ok_or_else(|| {
                    ConvertError::CorruptStream(format!(
                        "no remembered address for base register {base} at {:#x}",
                        ins.pc
                    ))
                })?
            };
            if !explicit_all && operand.remember_base {
                if let Some(base) = operand.base {
                    self.reg_vals.insert(base, addr);
                }
            }
            memrefs.push(TraceRecord::Memref {
                kind: ins.memref_kind(operand),
                size: operand.size,
                addr,
            });
        }
        Ok(memrefs)
    }

    fn next_memref_addr(&mut self) -> Result<u64, ConvertError> {
        loop {
            match self.reader.next()? {
                Some(RawEntry::Memref { addr }) => return Ok(addr),
                Some(RawEntry::Marker {
                    kind: RawMarker::WindowId,
                    value,
                }) => {
                    // Window markers land wherever the tracer flushed; keep
                    // their relative position.
                    self.emit(TraceRecord::Marker {
                        kind: TraceMarker::WindowId,
                        value,
                    })?;
                }
                Some(_) => {
                    self.reader.unread_last();
                    return Err(ConvertError::CorruptStream(
                        "expected a memory reference entry".into(),
                    ));
                }
                None => {
                    return Err(ConvertError::CorruptStream(
                        "stream ended inside a block".into(),
                    ))
                }
            }
        }
    }

    fn process_syscall(&mut self, sysnum: u64) -> Result<(), ConvertError> {
        self.flush_delayed(None)?;
        if self.last_syscall == Some(sysnum) && !self.instr_since_syscall {
            self.stats.duplicate_syscall += 1;
            self.dropped_last_syscall = true;
            warn!(sysnum, tid = self.tid, "dropping duplicate syscall marker");
            return Ok(());
        }
        if !self.last_instr_syscall {
            self.stats.false_syscall += 1;
            self.dropped_last_syscall = true;
            warn!(
                sysnum,
                tid = self.tid,
                "dropping syscall marker without a syscall instruction"
            );
            return Ok(());
        }
        self.dropped_last_syscall = false;
        self.last_syscall = Some(sysnum);
        self.instr_since_syscall = false;
        self.emit(TraceRecord::Marker {
            kind: TraceMarker::Syscall,
            value: sysnum,
        })?;
        self.inject_syscall(sysnum)
    }

    /// Appends kernel-side records for `sysnum` when a source exists.
    /// Every failure path here is degraded-not-fatal: the user-mode
    /// fallthrough is always preserved.
    fn inject_syscall(&mut self, sysnum: u64) -> Result<(), ConvertError> {
        if let Some(kernel) = self.kernel {
            match kernel.decode_syscall(self.tid, sysnum) {
                Ok(Some(result)) => {
                    let rejected = (!self.config.best_effort && result.non_fatal_errors > 0)
                        || result.discontinuities
                            > result
                                .non_fatal_errors
                                .saturating_mul(self.config.max_discontinuities_per_error);
                    if rejected {
                        self.stats.syscall_traces_conversion_failed += 1;
                        warn!(
                            sysnum,
                            errors = result.non_fatal_errors,
                            discontinuities = result.discontinuities,
                            "kernel capture rejected"
                        );
                        return Ok(());
                    }
                    if result.records.is_empty() {
                        self.stats.syscall_traces_conversion_empty += 1;
                        return Ok(());
                    }
                    self.emit(TraceRecord::Marker {
                        kind: TraceMarker::SyscallTraceStart,
                        value: sysnum,
                    })?;
                    for record in &result.records {
                        self.emit(*record)?;
                    }
                    self.emit(TraceRecord::Marker {
                        kind: TraceMarker::SyscallTraceEnd,
                        value: sysnum,
                    })?;
                    self.stats.syscall_traces_converted += 1;
                    self.stats.non_fatal_decode_errors += result.non_fatal_errors;
                    self.stats.kernel_instr_count += result.instr_count;
                    return Ok(());
                }
                Ok(None) => {}
                Err(error) => {
                    self.stats.syscall_traces_conversion_failed += 1;
                    warn!(sysnum, %error, "kernel capture decode failed");
                    return Ok(());
                }
            }
        }
        if let Some(templates) = self.templates {
            match templates.get(sysnum) {
                Some(template) => {
                    self.emit(TraceRecord::Marker {
                        kind: TraceMarker::SyscallTraceStart,
                        value: sysnum,
                    })?;
                    for record in template.records.iter().copied() {
                        self.emit(record)?;
                    }
                    self.emit(TraceRecord::Marker {
                        kind: TraceMarker::SyscallTraceEnd,
                        value: sysnum,
                    })?;
                    self.stats.syscall_traces_injected += 1;
                    self.stats.kernel_instr_count += template.instr_count;
                }
                None => {
                    self.stats.syscall_traces_conversion_empty += 1;
                    warn!(sysnum, "no template for syscall");
                }
            }
        }
        Ok(())
    }

    /// Routes a record to the rseq buffer while a sequence is open, else to
    /// the chunk writer.
    fn emit(&mut self, record: TraceRecord) -> Result<(), ConvertError> {
        match &mut self.rseq {
            Some(buffer) => {
                buffer.push(record);
                Ok(())
            }
            None => Ok(self.out.write(&record)?),
        }
    }

    /// Like [`emit`](Self::emit), but queues behind a pending delayed branch
    /// so pass-through markers do not overtake it.
    fn emit_or_delay(&mut self, record: TraceRecord) -> Result<(), ConvertError> {
        match &mut self.delayed {
            Some(delayed) => {
                delayed.trailing.push(record);
                Ok(())
            }
            None => self.emit(record),
        }
    }

    fn emit_instr(
        &mut self,
        kind: InstrKind,
        pc: u64,
        length: u8,
        bytes: &[u8],
        branch_target: Option<u64>,
    ) -> Result<(), ConvertError> {
        let encode = self.emit_encodings && self.out.needs_encoding(pc);
        let record = TraceRecord::Instr {
            kind,
            length: length as u16,
            pc,
        };
        match &mut self.rseq {
            Some(buffer) => {
                let first = buffer.record_len();
                if encode {
                    for enc in encoding_records(bytes) {
                        buffer.push(enc);
                    }
                }
                buffer.push_instr(first, record, pc, length, branch_target, encode);
                Ok(())
            }
            None => {
                if encode {
                    for enc in encoding_records(bytes) {
                        self.out.write(&enc)?;
                    }
                }
                Ok(self.out.write(&record)?)
            }
        }
    }

    fn flush_delayed(&mut self, next_pc: Option<u64>) -> Result<(), ConvertError> {
        let Some(delayed) = self.delayed.take() else {
            return Ok(());
        };
        let kind = match delayed.branch {
            BranchKind::ConditionalJump => match next_pc {
                Some(next) if Some(next) == delayed.target => InstrKind::TakenJump,
                Some(next) if next == delayed.pc + delayed.length as u64 => InstrKind::UntakenJump,
                _ => InstrKind::ConditionalJump,
            },
            branch => branch.instr_kind(),
        };
        self.emit_instr(kind, delayed.pc, delayed.length, &delayed.bytes, delayed.target)?;
        for record in delayed.memrefs {
            self.emit(record)?;
        }
        for record in delayed.trailing {
            self.emit(record)?;
        }
        Ok(())
    }

    fn commit_rseq(&mut self) -> Result<(), ConvertError> {
        if let Some(buffer) = self.rseq.take() {
            for record in buffer.into_records() {
                self.out.write(&record)?;
            }
        }
        Ok(())
    }

    /// Ends the open sequence at interruption address `pc`: an exact or
    /// containing match on a buffered instruction is an abort, anything else
    /// a side exit through a buffered branch. Either way only retired
    /// instructions reach the output, followed by the interrupt marker.
    fn abort_rseq(&mut self, pc: u64, marker: TraceMarker) -> Result<(), ConvertError> {
        let Some(mut buffer) = self.rseq.take() else {
            return self.emit(TraceRecord::Marker { kind: marker, value: pc });
        };
        match buffer.rollback_point(pc) {
            Some(cut) => {
                self.stats.rseq_abort += 1;
                for dropped in buffer.truncate(cut) {
                    if dropped.encoding_emitted {
                        self.out.rollback_encoding(dropped.pc);
                    }
                }
                buffer.resolve_last_branch(pc);
            }
            None => {
                self.stats.rseq_side_exit += 1;
                if let Some(cut) = buffer.side_exit_point() {
                    for dropped in buffer.truncate(cut) {
                        if dropped.encoding_emitted {
                            self.out.rollback_encoding(dropped.pc);
                        }
                    }
                }
            }
        }
        for record in buffer.into_records() {
            self.out.write(&record)?;
        }
        self.out.write(&TraceRecord::Marker { kind: marker, value: pc })?;
        Ok(())
    }
}
