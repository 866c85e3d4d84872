//! Decoder-facing traits and the per-instruction facts the engine caches.
//!
//! The converter never touches instruction bytes directly. It resolves a
//! (module index, module offset) pair to a mapped address through a
//! [`ModuleMapper`], asks an [`InstructionDecoder`] for the instruction at
//! that address, and works from the returned [`DecodedInstr`] from then on.
//! Decoded facts are condensed into [`InstrSummary`] values that live in the
//! per-worker block cache.

use crate::error::ConvertError;
use trace_format::record::{InstrKind, MemrefKind};

/// Architectural register identifier, opaque to the engine. Two operands
/// elide against each other exactly when their identifiers compare equal.
pub type RegId = u16;

bitflags::bitflags! {
    /// Category flags for one decoded instruction.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct InstrFlags: u16 {
        const READS_MEM = 1 << 0;
        const WRITES_MEM = 1 << 1;
        const IS_PREFETCH = 1 << 2;
        const IS_FLUSH = 1 << 3;
        const IS_SYSCALL = 1 << 4;
        /// Per-element vector memory access; exempt from address elision.
        const IS_SCATTER_GATHER = 1 << 5;
    }
}

/// Control-transfer category of a decoded instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BranchKind {
    DirectJump,
    IndirectJump,
    ConditionalJump,
    DirectCall,
    IndirectCall,
    Return,
}

impl BranchKind {
    /// The output record kind for this branch before taken/untaken
    /// resolution.
    pub fn instr_kind(self) -> InstrKind {
        match self {
            Self::DirectJump => InstrKind::DirectJump,
            Self::IndirectJump => InstrKind::IndirectJump,
            Self::ConditionalJump => InstrKind::ConditionalJump,
            Self::DirectCall => InstrKind::DirectCall,
            Self::IndirectCall => InstrKind::IndirectCall,
            Self::Return => InstrKind::Return,
        }
    }
}

/// One memory operand as reported by the decoder, sources before
/// destinations.
#[derive(Debug, Copy, Clone)]
pub struct MemOperand {
    pub base: Option<RegId>,
    pub pc_relative: bool,
    pub size: u16,
    pub is_store: bool,
}

/// Everything the engine needs to know about one instruction.
#[derive(Debug, Clone)]
pub struct DecodedInstr {
    pub length: u8,
    pub flags: InstrFlags,
    pub branch: Option<BranchKind>,
    /// Target address for direct transfers.
    pub branch_target: Option<u64>,
    pub operands: Vec<MemOperand>,
    /// Raw encoding bytes, emitted alongside the first occurrence of the
    /// instruction in each output chunk.
    pub bytes: Vec<u8>,
}

/// Resolves stable (module index, module offset) keys to mapped addresses.
///
/// The raw format identifies code by module so that blocks stay addressable
/// after the original pages are unmapped; all decoding goes through addresses
/// returned here.
pub trait ModuleMapper: Send + Sync {
    fn resolve(&self, modidx: u32, modoffs: u64) -> Result<u64, ConvertError>;
}

/// Synchronous, side-effect-free instruction decode at a mapped address.
///
/// Failure is fatal to the block being decoded and therefore to the
/// requesting thread's conversion: reconstruction depends on accurate
/// instruction lengths.
pub trait InstructionDecoder: Send + Sync {
    fn decode(&self, addr: u64) -> Result<DecodedInstr, ConvertError>;
}

/// A memory operand with its elision reconstruction flags.
#[derive(Debug, Copy, Clone)]
pub struct MemrefSummary {
    pub base: Option<RegId>,
    pub pc_relative: bool,
    pub size: u16,
    pub is_store: bool,
    /// Store this operand's effective address, keyed by base register, for
    /// reuse by a later operand in the same block.
    pub remember_base: bool,
    /// Reconstruct this operand's address from the remembered one instead of
    /// consuming a value from the raw stream.
    pub use_remembered_base: bool,
}

/// Cached decode of one instruction at a fixed address.
#[derive(Debug, Clone)]
pub struct InstrSummary {
    pub pc: u64,
    pub length: u8,
    pub flags: InstrFlags,
    pub branch: Option<BranchKind>,
    pub branch_target: Option<u64>,
    pub memrefs: Vec<MemrefSummary>,
    pub bytes: Vec<u8>,
}

impl InstrSummary {
    pub fn from_decoded(pc: u64, decoded: DecodedInstr) -> Self {
        let memrefs = decoded
            .operands
            .iter()
            .map(|op| MemrefSummary {
                base: op.base,
                pc_relative: op.pc_relative,
                size: op.size,
                is_store: op.is_store,
                remember_base: false,
                use_remembered_base: false,
            })
            .collect();
        Self {
            pc,
            length: decoded.length,
            flags: decoded.flags,
            branch: decoded.branch,
            branch_target: decoded.branch_target,
            memrefs,
            bytes: decoded.bytes,
        }
    }

    /// The output record kind, before branch taken/untaken resolution.
    pub fn instr_kind(&self) -> InstrKind {
        match self.branch {
            Some(branch) => branch.instr_kind(),
            None if self.flags.contains(InstrFlags::IS_SYSCALL) => InstrKind::Sysenter,
            None => InstrKind::Plain,
        }
    }

    pub fn memref_kind(&self, operand: &MemrefSummary) -> MemrefKind {
        if self.flags.contains(InstrFlags::IS_PREFETCH) {
            MemrefKind::Prefetch
        } else if self.flags.contains(InstrFlags::IS_FLUSH) {
            MemrefKind::Flush
        } else if operand.is_store {
            MemrefKind::Write
        } else {
            MemrefKind::Read
        }
    }

    /// Address immediately after this instruction.
    pub fn fall_through(&self) -> u64 {
        self.pc + self.length as u64
    }
}

/// The decoded instructions of one basic block, in execution order.
#[derive(Debug)]
pub struct BlockSummary {
    pub start: u64,
    pub instrs: Vec<InstrSummary>,
}

/// Marks which operand addresses the raw stream omits.
///
/// Walking operands in instruction order within the block: an operand whose
/// base register already produced an address earlier in the block reuses that
/// address (`use_remembered_base`), and the producing operand is flagged
/// `remember_base`. PC-relative operands always reconstruct from the
/// instruction address and never consume a raw entry. Scatter/gather
/// instructions keep every per-element address explicit, and their operands
/// neither remember nor reuse.
pub(crate) fn analyze_elision(instrs: &mut [InstrSummary]) {
    let mut remembered: hashbrown::HashMap<RegId, (usize, usize)> = hashbrown::HashMap::new();
    for i in 0..instrs.len() {
        if instrs[i].flags.contains(InstrFlags::IS_SCATTER_GATHER) {
            continue;
        }
        for j in 0..instrs[i].memrefs.len() {
            if instrs[i].memrefs[j].pc_relative {
                instrs[i].memrefs[j].use_remembered_base = true;
                continue;
            }
            let Some(base) = instrs[i].memrefs[j].base else {
                continue;
            };
            if let Some(&(pi, pj)) = remembered.get(&base) {
                instrs[i].memrefs[j].use_remembered_base = true;
                instrs[pi].memrefs[pj].remember_base = true;
            }
            remembered.insert(base, (i, j));
        }
    }
}
