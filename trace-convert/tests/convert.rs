use std::io::{self, BufWriter, Cursor, Write};
use std::sync::Arc;

use trace_convert::decode::{BranchKind, DecodedInstr, InstrFlags, InstructionDecoder, MemOperand};
use trace_convert::error::ConvertError;
use trace_convert::modmap::InMemoryMapper;
use trace_convert::sink::{MemorySink, StreamSink};
use trace_convert::syscall::{KernelTraceDecoder, SyscallTemplates, SyscallTraceResult};
use trace_convert::{ConvertConfig, ConvertOutput, Converter, Statistic, ThreadInput};
use trace_format::raw::{RawEntry, RawMarker};
use trace_format::record::{InstrKind, MemrefKind, RecordIter, TraceMarker, TraceRecord};
use trace_format::{FileType, TRACE_FORMAT_VERSION};

#[derive(Default)]
struct TableDecoder {
    instrs: std::collections::HashMap<u64, DecodedInstr>,
}

impl TableDecoder {
    fn insert(&mut self, pc: u64, instr: DecodedInstr) {
        self.instrs.insert(pc, instr);
    }
}

impl InstructionDecoder for TableDecoder {
    fn decode(&self, addr: u64) -> Result<DecodedInstr, ConvertError> {
        self.instrs.get(&addr).cloned().ok_or(ConvertError::Decode {
            pc: addr,
            reason: "not in table".into(),
        })
    }
}

fn plain(length: u8) -> DecodedInstr {
    DecodedInstr {
        length,
        flags: InstrFlags::empty(),
        branch: None,
        branch_target: None,
        operands: Vec::new(),
        bytes: vec![0x90; length as usize],
    }
}

fn load(length: u8, base: u16) -> DecodedInstr {
    DecodedInstr {
        operands: vec![MemOperand {
            base: Some(base),
            pc_relative: false,
            size: 8,
            is_store: false,
        }],
        flags: InstrFlags::READS_MEM,
        ..plain(length)
    }
}

fn syscall_instr(length: u8) -> DecodedInstr {
    DecodedInstr {
        flags: InstrFlags::IS_SYSCALL,
        ..plain(length)
    }
}

fn cond_branch(length: u8, target: u64) -> DecodedInstr {
    DecodedInstr {
        branch: Some(BranchKind::ConditionalJump),
        branch_target: Some(target),
        ..plain(length)
    }
}

fn direct_jump(length: u8, target: u64) -> DecodedInstr {
    DecodedInstr {
        branch: Some(BranchKind::DirectJump),
        branch_target: Some(target),
        ..plain(length)
    }
}

fn header(file_type: FileType) -> RawEntry {
    RawEntry::Header {
        version: TRACE_FORMAT_VERSION,
        file_type: file_type.bits(),
    }
}

fn marker(kind: RawMarker, value: u64) -> RawEntry {
    RawEntry::Marker { kind, value }
}

fn block(modoffs: u64, instr_count: u16) -> RawEntry {
    RawEntry::Block {
        modidx: 0,
        modoffs,
        instr_count,
    }
}

fn raw_stream(entries: &[RawEntry]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for entry in entries {
        entry.emit(&mut bytes).unwrap();
    }
    bytes
}

/// Module 0 mapped at 0x1000.
fn mapper() -> InMemoryMapper {
    let mut mapper = InMemoryMapper::new();
    mapper.insert(0, 0x1000, 0x10000);
    mapper
}

fn convert_one(
    raw: Vec<u8>,
    decoder: TableDecoder,
    config: ConvertConfig,
    templates: Option<SyscallTemplates>,
) -> (Vec<Vec<TraceRecord>>, ConvertOutput) {
    let sink = MemorySink::new();
    let mut converter = Converter::new(Arc::new(mapper()), Arc::new(decoder), config);
    if let Some(templates) = templates {
        converter = converter.with_templates(Arc::new(templates));
    }
    let output = converter
        .convert(vec![ThreadInput {
            tid: 1,
            input: Box::new(Cursor::new(raw)),
            sink: Box::new(sink.clone()),
        }])
        .unwrap();
    let chunks = sink
        .chunks()
        .iter()
        .map(|chunk| {
            RecordIter::new(chunk)
                .collect::<Result<Vec<_>, _>>()
                .unwrap()
        })
        .collect();
    (chunks, output)
}

fn single_worker() -> ConvertConfig {
    ConvertConfig {
        worker_count: 1,
        ..ConvertConfig::default()
    }
}

fn instr_records(records: &[TraceRecord]) -> Vec<TraceRecord> {
    records.iter().filter(|r| r.is_instr()).copied().collect()
}

fn encoding_count(records: &[TraceRecord]) -> usize {
    records
        .iter()
        .filter(|r| matches!(r, TraceRecord::Encoding { .. }))
        .count()
}

#[test]
fn plain_block_converts_record_for_record() {
    let mut decoder = TableDecoder::default();
    for pc in [0x1000, 0x1001, 0x1002] {
        decoder.insert(pc, plain(1));
    }
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(100),
        RawEntry::Pid(7),
        RawEntry::Timestamp(1000),
        marker(RawMarker::CpuId, 2),
        block(0, 3),
        RawEntry::ThreadExit(100),
        RawEntry::Footer,
    ]);
    let (chunks, output) = convert_one(raw, decoder, single_worker(), None);
    assert_eq!(chunks.len(), 1);
    let expected = vec![
        TraceRecord::Header {
            version: TRACE_FORMAT_VERSION,
            file_type: 0,
        },
        TraceRecord::Marker {
            kind: TraceMarker::ChunkInstrCount,
            value: trace_convert::DEFAULT_CHUNK_INSTR_COUNT,
        },
        TraceRecord::Tid(100),
        TraceRecord::Pid(7),
        TraceRecord::Marker {
            kind: TraceMarker::Timestamp,
            value: 1000,
        },
        TraceRecord::Marker {
            kind: TraceMarker::CpuId,
            value: 2,
        },
        TraceRecord::Instr {
            kind: InstrKind::Plain,
            length: 1,
            pc: 0x1000,
        },
        TraceRecord::Instr {
            kind: InstrKind::Plain,
            length: 1,
            pc: 0x1001,
        },
        TraceRecord::Instr {
            kind: InstrKind::Plain,
            length: 1,
            pc: 0x1002,
        },
        TraceRecord::ThreadExit(100),
        TraceRecord::Footer,
    ];
    assert_eq!(chunks[0], expected);
    assert_eq!(output.get_statistic(Statistic::FinalTraceInstructionCount), 3);
    assert_eq!(output.get_statistic(Statistic::EarliestTraceTimestamp), 1000);
    assert_eq!(output.get_statistic(Statistic::LatestTraceTimestamp), 1000);
}

#[test]
fn elided_addresses_are_reconstructed() {
    let mut decoder = TableDecoder::default();
    decoder.insert(0x1000, load(4, 1));
    decoder.insert(0x1004, load(4, 1));
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        block(0, 2),
        RawEntry::Memref { addr: 0xdead0 },
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let (chunks, output) = convert_one(raw, decoder, single_worker(), None);
    let memrefs: Vec<_> = chunks[0]
        .iter()
        .filter(|r| matches!(r, TraceRecord::Memref { .. }))
        .copied()
        .collect();
    // The second load's address never appears in the raw stream; it is
    // reconstructed from the first one's remembered base.
    assert_eq!(
        memrefs,
        vec![
            TraceRecord::Memref {
                kind: MemrefKind::Read,
                size: 8,
                addr: 0xdead0,
            };
            2
        ]
    );
    assert_eq!(output.get_statistic(Statistic::CountElided), 1);
}

#[test]
fn rseq_abort_rolls_back_to_the_interrupted_instruction() {
    let mut decoder = TableDecoder::default();
    decoder.insert(0x1000, plain(2));
    decoder.insert(0x1002, plain(2));
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        marker(RawMarker::RseqEntry, 0x1004),
        block(0, 2),
        marker(RawMarker::RseqAbort, 0x1002),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let (chunks, output) = convert_one(raw, decoder, single_worker(), None);
    let records = &chunks[0];
    assert_eq!(
        instr_records(records),
        vec![TraceRecord::Instr {
            kind: InstrKind::Plain,
            length: 2,
            pc: 0x1000,
        }]
    );
    assert!(records.contains(&TraceRecord::Marker {
        kind: TraceMarker::RseqAbort,
        value: 0x1002,
    }));
    assert_eq!(output.get_statistic(Statistic::RseqAbort), 1);
    assert_eq!(output.get_statistic(Statistic::FinalTraceInstructionCount), 1);
}

#[test]
fn committed_rseq_flushes_the_buffer_verbatim() {
    let mut decoder = TableDecoder::default();
    decoder.insert(0x1000, plain(2));
    decoder.insert(0x1002, plain(2));
    decoder.insert(0x1004, plain(1));
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        marker(RawMarker::RseqEntry, 0x1004),
        block(0, 2),
        block(4, 1),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let (chunks, output) = convert_one(raw, decoder, single_worker(), None);
    assert_eq!(instr_records(&chunks[0]).len(), 3);
    assert_eq!(output.get_statistic(Statistic::RseqAbort), 0);
    assert_eq!(output.get_statistic(Statistic::RseqSideExit), 0);
}

fn template_collection() -> SyscallTemplates {
    let mut bytes = Vec::new();
    let records = [
        TraceRecord::Header {
            version: TRACE_FORMAT_VERSION,
            file_type: FileType::SYSCALL_TEMPLATES.bits(),
        },
        TraceRecord::Marker {
            kind: TraceMarker::SyscallTraceStart,
            value: 5,
        },
        TraceRecord::Instr {
            kind: InstrKind::Plain,
            length: 4,
            pc: 0xffff_8000_0000_0000,
        },
        TraceRecord::Instr {
            kind: InstrKind::Return,
            length: 1,
            pc: 0xffff_8000_0000_0004,
        },
        TraceRecord::Marker {
            kind: TraceMarker::SyscallTraceEnd,
            value: 5,
        },
        TraceRecord::Footer,
    ];
    for record in records {
        record.emit(&mut bytes);
    }
    SyscallTemplates::load(&bytes).unwrap()
}

#[test]
fn syscall_template_is_injected_after_the_marker() {
    let mut decoder = TableDecoder::default();
    decoder.insert(0x1000, syscall_instr(2));
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        block(0, 1),
        marker(RawMarker::Syscall, 5),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let (chunks, output) = convert_one(raw, decoder, single_worker(), Some(template_collection()));
    let records = &chunks[0];

    let TraceRecord::Header { file_type, .. } = records[0] else {
        panic!("missing header");
    };
    assert!(FileType::from_bits_truncate(file_type).contains(FileType::KERNEL_SYSCALLS));

    let start = records
        .iter()
        .position(|r| {
            matches!(
                r,
                TraceRecord::Marker {
                    kind: TraceMarker::Syscall,
                    value: 5,
                }
            )
        })
        .unwrap();
    assert_eq!(
        records[start + 1],
        TraceRecord::Marker {
            kind: TraceMarker::SyscallTraceStart,
            value: 5,
        }
    );
    assert_eq!(
        records[start + 4],
        TraceRecord::Marker {
            kind: TraceMarker::SyscallTraceEnd,
            value: 5,
        }
    );
    assert_eq!(output.get_statistic(Statistic::SyscallTracesInjected), 1);
    assert_eq!(output.get_statistic(Statistic::KernelInstrCount), 2);
    // One user-mode instruction plus the two injected kernel ones.
    assert_eq!(output.get_statistic(Statistic::FinalTraceInstructionCount), 3);
}

#[test]
fn missing_template_degrades_without_aborting() {
    let mut decoder = TableDecoder::default();
    decoder.insert(0x1000, syscall_instr(2));
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        block(0, 1),
        marker(RawMarker::Syscall, 7),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let (chunks, output) = convert_one(raw, decoder, single_worker(), Some(template_collection()));
    assert_eq!(
        output.get_statistic(Statistic::SyscallTracesConversionEmpty),
        1
    );
    assert!(chunks[0].contains(&TraceRecord::Marker {
        kind: TraceMarker::Syscall,
        value: 7,
    }));
    assert!(!chunks[0].iter().any(|r| matches!(
        r,
        TraceRecord::Marker {
            kind: TraceMarker::SyscallTraceStart,
            ..
        }
    )));
    assert!(chunks[0].contains(&TraceRecord::Footer));
}

#[test]
fn syscall_marker_without_syscall_instruction_is_dropped() {
    let mut decoder = TableDecoder::default();
    decoder.insert(0x1000, plain(1));
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        block(0, 1),
        marker(RawMarker::Syscall, 3),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let (chunks, output) = convert_one(raw, decoder, single_worker(), None);
    assert_eq!(output.get_statistic(Statistic::FalseSyscall), 1);
    assert!(!chunks[0].iter().any(|r| matches!(
        r,
        TraceRecord::Marker {
            kind: TraceMarker::Syscall,
            ..
        }
    )));
}

#[test]
fn repeated_syscall_marker_is_dropped_as_duplicate() {
    let mut decoder = TableDecoder::default();
    decoder.insert(0x1000, syscall_instr(2));
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        block(0, 1),
        marker(RawMarker::Syscall, 5),
        marker(RawMarker::Syscall, 5),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let (chunks, output) = convert_one(raw, decoder, single_worker(), None);
    assert_eq!(output.get_statistic(Statistic::DuplicateSyscall), 1);
    let syscalls = chunks[0]
        .iter()
        .filter(|r| {
            matches!(
                r,
                TraceRecord::Marker {
                    kind: TraceMarker::Syscall,
                    ..
                }
            )
        })
        .count();
    assert_eq!(syscalls, 1);
}

#[test]
fn delayed_branch_resolves_against_the_next_block() {
    let mut decoder = TableDecoder::default();
    decoder.insert(0x1000, plain(1));
    decoder.insert(0x1001, cond_branch(2, 0x2000));
    decoder.insert(0x2000, plain(1));
    decoder.insert(0x1003, plain(1));

    // Taken: the next block starts at the branch target.
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        block(0, 2),
        block(0x1000, 1),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let mut taken_decoder = TableDecoder::default();
    for (pc, instr) in &decoder.instrs {
        taken_decoder.insert(*pc, instr.clone());
    }
    let (chunks, _) = convert_one(raw, taken_decoder, single_worker(), None);
    assert_eq!(
        instr_records(&chunks[0])[1],
        TraceRecord::Instr {
            kind: InstrKind::TakenJump,
            length: 2,
            pc: 0x1001,
        }
    );

    // Untaken: the next block starts at the fall-through.
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        block(0, 2),
        block(3, 1),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let (chunks, _) = convert_one(raw, decoder, single_worker(), None);
    assert_eq!(
        instr_records(&chunks[0])[1],
        TraceRecord::Instr {
            kind: InstrKind::UntakenJump,
            length: 2,
            pc: 0x1001,
        }
    );
}

#[test]
fn chunk_threshold_splits_output_and_reemits_encodings() {
    let mut decoder = TableDecoder::default();
    for pc in [0x1000, 0x1001, 0x1002] {
        decoder.insert(pc, plain(1));
    }
    let raw = raw_stream(&[
        header(FileType::ENCODINGS),
        RawEntry::Tid(1),
        block(0, 3),
        block(0, 3),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let config = ConvertConfig {
        worker_count: 1,
        chunk_instr_count: 2,
        ..ConvertConfig::default()
    };
    let (chunks, output) = convert_one(raw, decoder, config, None);
    assert_eq!(chunks.len(), 2);
    assert!(chunks[0].contains(&TraceRecord::Marker {
        kind: TraceMarker::ChunkFooter,
        value: 0,
    }));
    // Every address live in the second chunk gets its encoding again even
    // though it was already emitted in the first.
    assert_eq!(encoding_count(&chunks[0]), 3);
    assert_eq!(encoding_count(&chunks[1]), 3);
    assert_eq!(output.get_statistic(Statistic::FinalTraceInstructionCount), 6);
}

#[test]
fn encodings_are_emitted_once_per_chunk() {
    let mut decoder = TableDecoder::default();
    for pc in [0x1000, 0x1001, 0x1002] {
        decoder.insert(pc, plain(1));
    }
    let raw = raw_stream(&[
        header(FileType::ENCODINGS),
        RawEntry::Tid(1),
        block(0, 3),
        block(0, 3),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let (chunks, _) = convert_one(raw, decoder, single_worker(), None);
    assert_eq!(chunks.len(), 1);
    assert_eq!(encoding_count(&chunks[0]), 3);
    assert_eq!(instr_records(&chunks[0]).len(), 6);
}

#[test]
fn threads_convert_independently_across_workers() {
    let make_decoder = || {
        let mut decoder = TableDecoder::default();
        for pc in [0x1000, 0x1001, 0x1002] {
            decoder.insert(pc, plain(1));
        }
        decoder
    };
    let make_raw = |tid: u64| {
        raw_stream(&[
            header(FileType::empty()),
            RawEntry::Tid(tid),
            block(0, 3),
            RawEntry::ThreadExit(tid),
            RawEntry::Footer,
        ])
    };
    let sinks = [MemorySink::new(), MemorySink::new()];
    let converter = Converter::new(
        Arc::new(mapper()),
        Arc::new(make_decoder()),
        ConvertConfig {
            worker_count: 2,
            ..ConvertConfig::default()
        },
    );
    let inputs = vec![
        ThreadInput {
            tid: 10,
            input: Box::new(Cursor::new(make_raw(10))),
            sink: Box::new(sinks[0].clone()),
        },
        ThreadInput {
            tid: 20,
            input: Box::new(Cursor::new(make_raw(20))),
            sink: Box::new(sinks[1].clone()),
        },
    ];
    let output = converter.convert(inputs).unwrap();
    assert_eq!(output.get_statistic(Statistic::FinalTraceInstructionCount), 6);
    for sink in &sinks {
        let chunks = sink.chunks();
        let records: Vec<TraceRecord> = RecordIter::new(&chunks[0])
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.last(), Some(&TraceRecord::Footer));
    }
}

struct StubKernel {
    result: SyscallTraceResult,
}

impl KernelTraceDecoder for StubKernel {
    fn decode_syscall(
        &self,
        _tid: u64,
        _sysnum: u64,
    ) -> Result<Option<SyscallTraceResult>, ConvertError> {
        Ok(Some(self.result.clone()))
    }
}

fn kernel_result(non_fatal_errors: u64, discontinuities: u64) -> SyscallTraceResult {
    SyscallTraceResult {
        records: vec![
            TraceRecord::Instr {
                kind: InstrKind::Plain,
                length: 4,
                pc: 0xffff_8000_0000_0000,
            },
            TraceRecord::Instr {
                kind: InstrKind::Return,
                length: 1,
                pc: 0xffff_8000_0000_0004,
            },
        ],
        instr_count: 2,
        non_fatal_errors,
        discontinuities,
    }
}

fn syscall_raw() -> Vec<u8> {
    raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        block(0, 1),
        marker(RawMarker::Syscall, 5),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ])
}

fn convert_with_kernel(
    config: ConvertConfig,
    result: SyscallTraceResult,
) -> (Vec<Vec<TraceRecord>>, ConvertOutput) {
    let mut decoder = TableDecoder::default();
    decoder.insert(0x1000, syscall_instr(2));
    let sink = MemorySink::new();
    let converter = Converter::new(Arc::new(mapper()), Arc::new(decoder), config)
        .with_kernel_decoder(Arc::new(StubKernel { result }));
    let output = converter
        .convert(vec![ThreadInput {
            tid: 1,
            input: Box::new(Cursor::new(syscall_raw())),
            sink: Box::new(sink.clone()),
        }])
        .unwrap();
    let chunks = sink
        .chunks()
        .iter()
        .map(|chunk| {
            RecordIter::new(chunk)
                .collect::<Result<Vec<_>, _>>()
                .unwrap()
        })
        .collect();
    (chunks, output)
}

#[test]
fn clean_kernel_capture_is_converted() {
    let (chunks, output) = convert_with_kernel(single_worker(), kernel_result(0, 0));
    let records = &chunks[0];
    let start = records
        .iter()
        .position(|r| {
            matches!(
                r,
                TraceRecord::Marker {
                    kind: TraceMarker::SyscallTraceStart,
                    value: 5,
                }
            )
        })
        .unwrap();
    assert_eq!(
        records[start + 3],
        TraceRecord::Marker {
            kind: TraceMarker::SyscallTraceEnd,
            value: 5,
        }
    );
    assert_eq!(output.get_statistic(Statistic::SyscallTracesConverted), 1);
    assert_eq!(output.get_statistic(Statistic::KernelInstrCount), 2);
    assert_eq!(output.get_statistic(Statistic::FinalTraceInstructionCount), 3);
}

#[test]
fn kernel_decode_errors_require_best_effort() {
    let (chunks, output) = convert_with_kernel(single_worker(), kernel_result(1, 0));
    assert_eq!(
        output.get_statistic(Statistic::SyscallTracesConversionFailed),
        1
    );
    assert!(!chunks[0].iter().any(|r| matches!(
        r,
        TraceRecord::Marker {
            kind: TraceMarker::SyscallTraceStart,
            ..
        }
    )));
    // The user-mode syscall marker survives the rejected injection.
    assert!(chunks[0].contains(&TraceRecord::Marker {
        kind: TraceMarker::Syscall,
        value: 5,
    }));
}

#[test]
fn best_effort_accepts_bounded_discontinuities() {
    let config = ConvertConfig {
        worker_count: 1,
        best_effort: true,
        max_discontinuities_per_error: 1,
        ..ConvertConfig::default()
    };
    let (chunks, output) = convert_with_kernel(config, kernel_result(1, 1));
    let TraceRecord::Header { file_type, .. } = chunks[0][0] else {
        panic!("missing header");
    };
    assert!(
        FileType::from_bits_truncate(file_type).contains(FileType::KERNEL_SYSCALLS_DEGRADED)
    );
    assert_eq!(output.get_statistic(Statistic::SyscallTracesConverted), 1);
    assert_eq!(
        output.get_statistic(Statistic::SyscallTracesNonFatalDecodingErrorCount),
        1
    );
}

#[test]
fn best_effort_still_rejects_excess_discontinuities() {
    let config = ConvertConfig {
        worker_count: 1,
        best_effort: true,
        max_discontinuities_per_error: 1,
        ..ConvertConfig::default()
    };
    let (_, output) = convert_with_kernel(config, kernel_result(1, 3));
    assert_eq!(
        output.get_statistic(Statistic::SyscallTracesConversionFailed),
        1
    );
    assert_eq!(output.get_statistic(Statistic::SyscallTracesConverted), 0);
}

#[test]
fn empty_kernel_capture_counts_as_empty() {
    let empty = SyscallTraceResult {
        records: Vec::new(),
        instr_count: 0,
        non_fatal_errors: 0,
        discontinuities: 0,
    };
    let (chunks, output) = convert_with_kernel(single_worker(), empty);
    assert_eq!(
        output.get_statistic(Statistic::SyscallTracesConversionEmpty),
        1
    );
    assert!(!chunks[0].iter().any(|r| matches!(
        r,
        TraceRecord::Marker {
            kind: TraceMarker::SyscallTraceStart,
            ..
        }
    )));
}

#[test]
fn rseq_side_exit_keeps_records_through_the_exiting_branch() {
    let mut decoder = TableDecoder::default();
    decoder.insert(0x1000, plain(2));
    decoder.insert(0x1002, direct_jump(2, 0x9000));
    decoder.insert(0x1004, plain(2));
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        marker(RawMarker::RseqEntry, 0x1006),
        block(0, 3),
        marker(RawMarker::RseqAbort, 0x9000),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let (chunks, output) = convert_one(raw, decoder, single_worker(), None);
    // The trailing instruction after the region-leaving jump never retired.
    assert_eq!(
        instr_records(&chunks[0])
            .iter()
            .map(|r| r.instr_pc().unwrap())
            .collect::<Vec<_>>(),
        vec![0x1000, 0x1002]
    );
    assert!(chunks[0].contains(&TraceRecord::Marker {
        kind: TraceMarker::RseqAbort,
        value: 0x9000,
    }));
    assert_eq!(output.get_statistic(Statistic::RseqSideExit), 1);
    assert_eq!(output.get_statistic(Statistic::RseqAbort), 0);
    assert_eq!(output.get_statistic(Statistic::FinalTraceInstructionCount), 2);
}

#[test]
fn queued_timestamp_sample_counts_the_pending_branch() {
    let mut decoder = TableDecoder::default();
    decoder.insert(0x1000, plain(1));
    decoder.insert(0x1001, cond_branch(2, 0x2000));
    decoder.insert(0x2000, plain(1));
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        RawEntry::Timestamp(100),
        block(0, 2),
        RawEntry::Timestamp(500),
        block(0x1000, 1),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let (chunks, output) = convert_one(raw, decoder, single_worker(), None);
    // The second timestamp queues behind the unresolved branch, so its
    // sample counts that branch as already retired.
    let ordinals: Vec<(u64, u64)> = output
        .schedule
        .serial()
        .iter()
        .map(|s| (s.timestamp, s.instr_ordinal))
        .collect();
    assert_eq!(ordinals, vec![(100, 0), (500, 2)]);
    let branch_index = chunks[0]
        .iter()
        .position(|r| r.instr_pc() == Some(0x1001))
        .unwrap();
    assert_eq!(
        chunks[0][branch_index + 1],
        TraceRecord::Marker {
            kind: TraceMarker::Timestamp,
            value: 500,
        }
    );
}

struct BrokenDisk;

impl Write for BrokenDisk {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "disk gone"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "disk gone"))
    }
}

#[test]
fn unwritable_sink_fails_the_conversion() {
    let mut decoder = TableDecoder::default();
    for pc in [0x1000, 0x1001, 0x1002] {
        decoder.insert(pc, plain(1));
    }
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        block(0, 3),
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    // Large enough that every record stays buffered until the final flush.
    let sink = StreamSink(BufWriter::with_capacity(1 << 20, BrokenDisk));
    let converter = Converter::new(Arc::new(mapper()), Arc::new(decoder), single_worker());
    let result = converter.convert(vec![ThreadInput {
        tid: 1,
        input: Box::new(Cursor::new(raw)),
        sink: Box::new(sink),
    }]);
    assert!(matches!(result, Err(ConvertError::Io(_))));
}

#[test]
fn unmapped_module_fails_the_conversion() {
    let raw = raw_stream(&[
        header(FileType::empty()),
        RawEntry::Tid(1),
        RawEntry::Block {
            modidx: 9,
            modoffs: 0,
            instr_count: 1,
        },
        RawEntry::ThreadExit(1),
        RawEntry::Footer,
    ]);
    let sink = MemorySink::new();
    let converter = Converter::new(
        Arc::new(mapper()),
        Arc::new(TableDecoder::default()),
        single_worker(),
    );
    let result = converter.convert(vec![ThreadInput {
        tid: 1,
        input: Box::new(Cursor::new(raw)),
        sink: Box::new(sink.clone()),
    }]);
    assert!(matches!(
        result,
        Err(ConvertError::UnmappedModule { modidx: 9, .. })
    ));
}
