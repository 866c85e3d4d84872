//! Buffered output for open restartable sequences.
//!
//! While a restartable sequence is open, the engine appends records here
//! instead of the chunk writer, remembering for each instruction where its
//! records begin (including any encoding records in front of the
//! instruction record) and where the instruction record itself sits. A
//! commit drains the buffer verbatim; an abort or side exit truncates it
//! first so only retired instructions reach the output.

use trace_format::record::{InstrKind, TraceRecord};

#[derive(Debug)]
pub(crate) struct BufferedInstr {
    /// Index of this instruction's first record (its encoding, if emitted).
    pub first_record_index: usize,
    /// Index of the instruction record proper.
    pub instr_record_index: usize,
    pub pc: u64,
    pub length: u8,
    pub branch_target: Option<u64>,
    pub encoding_emitted: bool,
}

#[derive(Debug)]
pub(crate) struct RseqBuffer {
    end_pc: u64,
    records: Vec<TraceRecord>,
    instrs: Vec<BufferedInstr>,
}

impl RseqBuffer {
    pub fn new(end_pc: u64) -> Self {
        Self {
            end_pc,
            records: Vec::new(),
            instrs: Vec::new(),
        }
    }

    pub fn end_pc(&self) -> u64 {
        self.end_pc
    }

    pub fn record_len(&self) -> usize {
        self.records.len()
    }

    pub fn push(&mut self, record: TraceRecord) {
        self.records.push(record);
    }

    /// Appends an instruction record whose encoding records (if any) were
    /// already pushed starting at `first_record_index`.
    pub fn push_instr(
        &mut self,
        first_record_index: usize,
        record: TraceRecord,
        pc: u64,
        length: u8,
        branch_target: Option<u64>,
        encoding_emitted: bool,
    ) {
        let instr_record_index = self.records.len();
        self.records.push(record);
        self.instrs.push(BufferedInstr {
            first_record_index,
            instr_record_index,
            pc,
            length,
            branch_target,
            encoding_emitted,
        });
    }

    /// Record index to truncate from for a rollback at `pc`.
    ///
    /// Prefers the last buffered instruction at exactly `pc`; interruption
    /// points are recorded at instruction granularity, so a `pc` landing
    /// inside an instruction rolls back to that instruction's start. Returns
    /// `None` when no buffered instruction covers `pc`.
    pub fn rollback_point(&self, pc: u64) -> Option<usize> {
        if let Some(hit) = self.instrs.iter().rev().find(|i| i.pc == pc) {
            return Some(hit.first_record_index);
        }
        self.instrs
            .iter()
            .rev()
            .find(|i| i.pc < pc && pc < i.pc + i.length as u64)
            .map(|i| i.first_record_index)
    }

    /// Record index just past the last branch that leaves the region, for a
    /// side exit. `None` when no buffered branch exits the region.
    pub fn side_exit_point(&self) -> Option<usize> {
        let start = self.instrs.first()?.pc;
        let exit = self.instrs.iter().rposition(|i| {
            i.branch_target
                .is_some_and(|t| t < start || t >= self.end_pc)
        })?;
        Some(match self.instrs.get(exit + 1) {
            Some(next) => next.first_record_index,
            None => self.records.len(),
        })
    }

    /// Drops every record from `cut` on, returning the dropped instructions
    /// so the caller can roll their encoding emissions back.
    pub fn truncate(&mut self, cut: usize) -> Vec<BufferedInstr> {
        self.records.truncate(cut);
        let keep = self
            .instrs
            .iter()
            .position(|i| i.first_record_index >= cut)
            .unwrap_or(self.instrs.len());
        self.instrs.split_off(keep)
    }

    /// Rewrites a trailing unresolved conditional branch now that the resume
    /// address is known.
    pub fn resolve_last_branch(&mut self, resume_pc: u64) {
        let Some(last) = self.instrs.last() else {
            return;
        };
        let TraceRecord::Instr { kind, length, pc } = self.records[last.instr_record_index] else {
            return;
        };
        if kind != InstrKind::ConditionalJump {
            return;
        }
        let kind = if last.branch_target == Some(resume_pc) {
            InstrKind::TakenJump
        } else if resume_pc == pc + length as u64 {
            InstrKind::UntakenJump
        } else {
            return;
        };
        self.records[last.instr_record_index] = TraceRecord::Instr { kind, length, pc };
    }

    pub fn into_records(self) -> Vec<TraceRecord> {
        self.records
    }
}
