//! x86-64 instruction decoding backed by iced-x86.

use iced_x86::{
    Decoder, DecoderOptions, FlowControl, InstructionInfoFactory, Mnemonic, OpAccess, Register,
};

use crate::decode::{
    BranchKind, DecodedInstr, InstrFlags, InstructionDecoder, MemOperand, RegId,
};
use crate::error::ConvertError;

/// Bytes backing one mapped code extent.
#[derive(Debug)]
pub enum SegmentBytes {
    Owned(Vec<u8>),
    Mapped(memmap::Mmap),
}

impl SegmentBytes {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => bytes,
            Self::Mapped(map) => map,
        }
    }
}

impl From<Vec<u8>> for SegmentBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Owned(bytes)
    }
}

impl From<memmap::Mmap> for SegmentBytes {
    fn from(map: memmap::Mmap) -> Self {
        Self::Mapped(map)
    }
}

struct Segment {
    base: u64,
    bytes: SegmentBytes,
}

/// Decoder over a set of mapped code segments.
#[derive(Default)]
pub struct X86Decoder {
    segments: Vec<Segment>,
}

impl X86Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_segment(&mut self, base: u64, bytes: impl Into<SegmentBytes>) {
        self.segments.push(Segment {
            base,
            bytes: bytes.into(),
        });
    }

    fn segment_at(&self, addr: u64) -> Option<(&Segment, usize)> {
        self.segments.iter().find_map(|segment| {
            let len = segment.bytes.as_bytes().len() as u64;
            (addr >= segment.base && addr < segment.base + len)
                .then(|| (segment, (addr - segment.base) as usize))
        })
    }
}

fn is_prefetch(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Prefetcht0
            | Mnemonic::Prefetcht1
            | Mnemonic::Prefetcht2
            | Mnemonic::Prefetchnta
            | Mnemonic::Prefetchw
            | Mnemonic::Prefetchwt1
    )
}

fn is_flush(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::Clflush | Mnemonic::Clflushopt | Mnemonic::Clwb
    )
}

fn is_syscall(mnemonic: Mnemonic) -> bool {
    matches!(mnemonic, Mnemonic::Syscall | Mnemonic::Sysenter | Mnemonic::Int)
}

impl InstructionDecoder for X86Decoder {
    fn decode(&self, addr: u64) -> Result<DecodedInstr, ConvertError> {
        let Some((segment, offset)) = self.segment_at(addr) else {
            return Err(ConvertError::Decode {
                pc: addr,
                reason: "address outside every mapped segment".into(),
            });
        };
        let bytes = &segment.bytes.as_bytes()[offset..];
        let mut decoder = Decoder::with_ip(64, bytes, addr, DecoderOptions::NONE);
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(ConvertError::Decode {
                pc: addr,
                reason: "invalid instruction".into(),
            });
        }

        let mut flags = InstrFlags::empty();
        let mnemonic = instruction.mnemonic();
        if is_prefetch(mnemonic) {
            flags |= InstrFlags::IS_PREFETCH;
        }
        if is_flush(mnemonic) {
            flags |= InstrFlags::IS_FLUSH;
        }
        if is_syscall(mnemonic) {
            flags |= InstrFlags::IS_SYSCALL;
        }
        if instruction.is_vsib() {
            flags |= InstrFlags::IS_SCATTER_GATHER;
        }

        let (branch, branch_target) = match instruction.flow_control() {
            FlowControl::UnconditionalBranch => (
                Some(BranchKind::DirectJump),
                Some(instruction.near_branch_target()),
            ),
            FlowControl::IndirectBranch => (Some(BranchKind::IndirectJump), None),
            FlowControl::ConditionalBranch => (
                Some(BranchKind::ConditionalJump),
                Some(instruction.near_branch_target()),
            ),
            FlowControl::Call => (
                Some(BranchKind::DirectCall),
                Some(instruction.near_branch_target()),
            ),
            FlowControl::IndirectCall => (Some(BranchKind::IndirectCall), None),
            FlowControl::Return => (Some(BranchKind::Return), None),
            _ => (None, None),
        };

        let mut info_factory = InstructionInfoFactory::new();
        let info = info_factory.info(&instruction);
        let mut sources = Vec::new();
        let mut destinations = Vec::new();
        for used in info.used_memory() {
            let operand = MemOperand {
                base: match used.base() {
                    Register::None | Register::RIP => None,
                    base => Some(base as RegId),
                },
                pc_relative: used.base() == Register::RIP,
                size: used.memory_size().size() as u16,
                is_store: false,
            };
            match used.access() {
                OpAccess::Read | OpAccess::CondRead => sources.push(operand),
                OpAccess::Write | OpAccess::CondWrite => destinations.push(MemOperand {
                    is_store: true,
                    ..operand
                }),
                OpAccess::ReadWrite | OpAccess::ReadCondWrite => {
                    sources.push(operand);
                    destinations.push(MemOperand {
                        is_store: true,
                        ..operand
                    });
                }
                _ => {}
            }
        }
        if !sources.is_empty() {
            flags |= InstrFlags::READS_MEM;
        }
        if !destinations.is_empty() {
            flags |= InstrFlags::WRITES_MEM;
        }
        let mut operands = sources;
        operands.append(&mut destinations);

        let length = instruction.len();
        Ok(DecodedInstr {
            length: length as u8,
            flags,
            branch,
            branch_target,
            operands,
            bytes: bytes[..length].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder_with(base: u64, code: &[u8]) -> X86Decoder {
        let mut decoder = X86Decoder::new();
        decoder.add_segment(base, code.to_vec());
        decoder
    }

    #[test]
    fn decodes_a_register_load() {
        // mov rax, [rbx]
        let decoder = decoder_with(0x1000, &[0x48, 0x8b, 0x03]);
        let decoded = decoder.decode(0x1000).unwrap();
        assert_eq!(decoded.length, 3);
        assert!(decoded.branch.is_none());
        assert!(decoded.flags.contains(InstrFlags::READS_MEM));
        assert_eq!(decoded.operands.len(), 1);
        assert_eq!(decoded.operands[0].base, Some(Register::RBX as RegId));
        assert!(!decoded.operands[0].is_store);
        assert_eq!(decoded.bytes, vec![0x48, 0x8b, 0x03]);
    }

    #[test]
    fn classifies_a_return() {
        let decoder = decoder_with(0x2000, &[0xc3]);
        let decoded = decoder.decode(0x2000).unwrap();
        assert_eq!(decoded.length, 1);
        assert_eq!(decoded.branch, Some(BranchKind::Return));
        // The implicit stack pop is a memory read.
        assert!(decoded.flags.contains(InstrFlags::READS_MEM));
    }

    #[test]
    fn direct_jump_carries_its_target() {
        // jmp +5 (rel8), encoded at 0x3000: target 0x3000 + 2 + 5
        let decoder = decoder_with(0x3000, &[0xeb, 0x05]);
        let decoded = decoder.decode(0x3000).unwrap();
        assert_eq!(decoded.branch, Some(BranchKind::DirectJump));
        assert_eq!(decoded.branch_target, Some(0x3007));
    }

    #[test]
    fn unmapped_addresses_fail() {
        let decoder = decoder_with(0x1000, &[0x90]);
        assert!(matches!(
            decoder.decode(0x9000),
            Err(ConvertError::Decode { pc: 0x9000, .. })
        ));
    }
}
