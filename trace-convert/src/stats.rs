//! Conversion statistics, per thread and aggregated.

/// The closed set of counters queryable after a conversion completes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Statistic {
    /// Memory-reference addresses reconstructed instead of read from raw.
    CountElided,
    /// Syscall markers dropped because an identical one directly preceded.
    DuplicateSyscall,
    /// Syscall markers dropped for want of a preceding syscall instruction.
    FalseSyscall,
    RseqAbort,
    RseqSideExit,
    SyscallTracesInjected,
    SyscallTracesConverted,
    SyscallTracesConversionFailed,
    /// Kernel captures (or templates) that turned out empty or absent.
    SyscallTracesConversionEmpty,
    SyscallTracesNonFatalDecodingErrorCount,
    KernelInstrCount,
    FinalTraceInstructionCount,
    EarliestTraceTimestamp,
    LatestTraceTimestamp,
}

/// Counters accumulated while converting one thread.
#[derive(Debug, Default)]
pub struct ThreadStats {
    pub count_elided: u64,
    pub duplicate_syscall: u64,
    pub false_syscall: u64,
    pub rseq_abort: u64,
    pub rseq_side_exit: u64,
    pub syscall_traces_injected: u64,
    pub syscall_traces_converted: u64,
    pub syscall_traces_conversion_failed: u64,
    pub syscall_traces_conversion_empty: u64,
    pub non_fatal_decode_errors: u64,
    pub kernel_instr_count: u64,
    pub final_instr_count: u64,
    pub earliest_timestamp: Option<u64>,
    pub latest_timestamp: Option<u64>,
}

impl ThreadStats {
    pub fn record_timestamp(&mut self, timestamp: u64) {
        self.earliest_timestamp = Some(
            self.earliest_timestamp
                .map_or(timestamp, |t| t.min(timestamp)),
        );
        self.latest_timestamp = Some(self.latest_timestamp.map_or(timestamp, |t| t.max(timestamp)));
    }
}

/// Whole-run totals, produced by merging per-thread counters after the worker
/// join barrier. Plain sums throughout, except min/max for the timestamp
/// bounds.
#[derive(Debug, Default)]
pub struct GlobalStats {
    count_elided: u64,
    duplicate_syscall: u64,
    false_syscall: u64,
    rseq_abort: u64,
    rseq_side_exit: u64,
    syscall_traces_injected: u64,
    syscall_traces_converted: u64,
    syscall_traces_conversion_failed: u64,
    syscall_traces_conversion_empty: u64,
    non_fatal_decode_errors: u64,
    kernel_instr_count: u64,
    final_instr_count: u64,
    earliest_timestamp: Option<u64>,
    latest_timestamp: Option<u64>,
}

impl GlobalStats {
    pub fn merge(&mut self, thread: &ThreadStats) {
        self.count_elided += thread.count_elided;
        self.duplicate_syscall += thread.duplicate_syscall;
        self.false_syscall += thread.false_syscall;
        self.rseq_abort += thread.rseq_abort;
        self.rseq_side_exit += thread.rseq_side_exit;
        self.syscall_traces_injected += thread.syscall_traces_injected;
        self.syscall_traces_converted += thread.syscall_traces_converted;
        self.syscall_traces_conversion_failed += thread.syscall_traces_conversion_failed;
        self.syscall_traces_conversion_empty += thread.syscall_traces_conversion_empty;
        self.non_fatal_decode_errors += thread.non_fatal_decode_errors;
        self.kernel_instr_count += thread.kernel_instr_count;
        self.final_instr_count += thread.final_instr_count;
        if let Some(ts) = thread.earliest_timestamp {
            self.earliest_timestamp = Some(self.earliest_timestamp.map_or(ts, |t| t.min(ts)));
        }
        if let Some(ts) = thread.latest_timestamp {
            self.latest_timestamp = Some(self.latest_timestamp.map_or(ts, |t| t.max(ts)));
        }
    }

    pub fn get(&self, statistic: Statistic) -> u64 {
        match statistic {
            Statistic::CountElided => self.count_elided,
            Statistic::DuplicateSyscall => self.duplicate_syscall,
            Statistic::FalseSyscall => self.false_syscall,
            Statistic::RseqAbort => self.rseq_abort,
            Statistic::RseqSideExit => self.rseq_side_exit,
            Statistic::SyscallTracesInjected => self.syscall_traces_injected,
            Statistic::SyscallTracesConverted => self.syscall_traces_converted,
            Statistic::SyscallTracesConversionFailed => self.syscall_traces_conversion_failed,
            Statistic::SyscallTracesConversionEmpty => self.syscall_traces_conversion_empty,
            Statistic::SyscallTracesNonFatalDecodingErrorCount => self.non_fatal_decode_errors,
            Statistic::KernelInstrCount => self.kernel_instr_count,
            Statistic::FinalTraceInstructionCount => self.final_instr_count,
            Statistic::EarliestTraceTimestamp => self.earliest_timestamp.unwrap_or(0),
            Statistic::LatestTraceTimestamp => self.latest_timestamp.unwrap_or(0),
        }
    }
}
