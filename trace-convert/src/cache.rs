//! Per-worker cache of decoded basic blocks.
//!
//! Hot loops revisit the same blocks constantly; each worker memoizes the
//! decode so every (module index, module offset) pair is decoded exactly
//! once. The key is module-relative, not the mapped address, so entries stay
//! valid after the traced process unmaps the original pages. No locks: a
//! cache instance is owned by one worker for its whole lifetime.

use std::rc::Rc;

use crate::decode::{analyze_elision, BlockSummary, InstructionDecoder, InstrSummary};
use crate::error::ConvertError;

#[derive(Default)]
pub struct BlockCache {
    blocks: hashbrown::HashMap<(u32, u64), Rc<BlockSummary>>,
}

impl BlockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, modidx: u32, modoffs: u64) -> Option<Rc<BlockSummary>> {
        self.blocks.get(&(modidx, modoffs)).cloned()
    }

    /// Returns the cached block, decoding it on first use.
    ///
    /// Decodes `instr_count` consecutive instructions starting at
    /// `block_start`, then runs elision analysis over the block. A decode
    /// failure anywhere in the block is fatal to the requesting thread.
    pub fn get_or_create(
        &mut self,
        modidx: u32,
        modoffs: u64,
        block_start: u64,
        instr_count: u16,
        decoder: &dyn InstructionDecoder,
    ) -> Result<Rc<BlockSummary>, ConvertError> {
        if let Some(block) = self.blocks.get(&(modidx, modoffs)) {
            return Ok(Rc::clone(block));
        }
        let mut instrs = Vec::with_capacity(instr_count as usize);
        let mut pc = block_start;
        for _ in 0..instr_count {
            let decoded = decoder.decode(pc)?;
            let next = pc + decoded.length as u64;
            instrs.push(InstrSummary::from_decoded(pc, decoded));
            pc = next;
        }
        analyze_elision(&mut instrs);
        let block = Rc::new(BlockSummary {
            start: block_start,
            instrs,
        });
        self.blocks.insert((modidx, modoffs), Rc::clone(&block));
        Ok(block)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{DecodedInstr, InstrFlags};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDecoder {
        calls: AtomicUsize,
    }

    impl InstructionDecoder for CountingDecoder {
        fn decode(&self, _addr: u64) -> Result<DecodedInstr, ConvertError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(DecodedInstr {
                length: 2,
                flags: InstrFlags::empty(),
                branch: None,
                branch_target: None,
                operands: Vec::new(),
                bytes: vec![0x66, 0x90],
            })
        }
    }

    #[test]
    fn blocks_decode_exactly_once() {
        let decoder = CountingDecoder {
            calls: AtomicUsize::new(0),
        };
        let mut cache = BlockCache::new();
        let first = cache.get_or_create(1, 0x40, 0x1000, 3, &decoder).unwrap();
        assert_eq!(first.instrs.len(), 3);
        assert_eq!(first.instrs[1].pc, 0x1002);
        assert_eq!(decoder.calls.load(Ordering::Relaxed), 3);

        let second = cache.get_or_create(1, 0x40, 0x1000, 3, &decoder).unwrap();
        assert_eq!(decoder.calls.load(Ordering::Relaxed), 3);
        assert!(Rc::ptr_eq(&first, &second));
        assert!(cache.lookup(1, 0x40).is_some());
        assert!(cache.lookup(2, 0x40).is_none());

        cache.clear();
        assert!(cache.is_empty());
    }

    struct FailingDecoder;

    impl InstructionDecoder for FailingDecoder {
        fn decode(&self, pc: u64) -> Result<DecodedInstr, ConvertError> {
            Err(ConvertError::Decode {
                pc,
                reason: "bad opcode".into(),
            })
        }
    }

    #[test]
    fn decode_failure_is_propagated() {
        let mut cache = BlockCache::new();
        let result = cache.get_or_create(0, 0, 0x2000, 1, &FailingDecoder);
        assert!(matches!(result, Err(ConvertError::Decode { pc: 0x2000, .. })));
        assert!(cache.is_empty());
    }
}
