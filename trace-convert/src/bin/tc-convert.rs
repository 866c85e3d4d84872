use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trace_convert::modmap::InMemoryMapper;
use trace_convert::sink::StreamSink;
use trace_convert::syscall::SyscallTemplates;
use trace_convert::x86::X86Decoder;
use trace_convert::{ConvertConfig, Converter, Statistic, ThreadInput};

/// Convert raw per-thread traces into analysis-ready trace files.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Directory of per-thread raw streams, one `<tid>.raw` file each.
    #[arg(long)]
    indir: PathBuf,

    /// Directory receiving the converted `<tid>.trace` files.
    #[arg(long)]
    outdir: PathBuf,

    /// Module table: one `<modidx> <base-hex> <path>` line per module.
    #[arg(long)]
    modmap: PathBuf,

    /// Syscall template collection to inject from.
    #[arg(long)]
    syscall_templates: Option<PathBuf>,

    /// Worker threads.
    #[arg(long, short)]
    jobs: Option<usize>,

    /// Instructions per output chunk.
    #[arg(long, default_value_t = trace_convert::DEFAULT_CHUNK_INSTR_COUNT)]
    chunk_instr_count: u64,

    /// Keep partially decoded kernel captures.
    #[arg(long)]
    best_effort: bool,

    /// PC discontinuities tolerated per non-fatal kernel decode error.
    #[arg(long, default_value_t = 1)]
    max_discontinuities_per_error: u64,

    /// Also write serial and per-CPU schedule files.
    #[arg(long)]
    schedule: bool,
}

fn load_modules(path: &Path) -> anyhow::Result<(InMemoryMapper, X86Decoder)> {
    let table = std::fs::read_to_string(path)
        .with_context(|| format!("reading module table {}", path.display()))?;
    let mut mapper = InMemoryMapper::new();
    let mut decoder = X86Decoder::new();
    for (lineno, line) in table.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.splitn(3, ' ');
        let (Some(modidx), Some(base), Some(module_path)) =
            (fields.next(), fields.next(), fields.next())
        else {
            bail!("{}:{}: expected `modidx base path`", path.display(), lineno + 1);
        };
        let modidx: u32 = modidx
            .parse()
            .with_context(|| format!("{}:{}: module index", path.display(), lineno + 1))?;
        let base = u64::from_str_radix(base.trim_start_matches("0x"), 16)
            .with_context(|| format!("{}:{}: base address", path.display(), lineno + 1))?;
        let file = File::open(module_path)
            .with_context(|| format!("opening module {module_path}"))?;
        let map = unsafe { memmap::Mmap::map(&file) }
            .with_context(|| format!("mapping module {module_path}"))?;
        mapper.insert(modidx, base, map.len() as u64);
        decoder.add_segment(base, map);
    }
    if mapper.is_empty() {
        bail!("module table {} is empty", path.display());
    }
    Ok((mapper, decoder))
}

fn collect_inputs(args: &Args) -> anyhow::Result<Vec<ThreadInput>> {
    let mut inputs = Vec::new();
    for entry in std::fs::read_dir(&args.indir)
        .with_context(|| format!("reading {}", args.indir.display()))?
    {
        let path = entry?.path();
        if path.extension().map_or(true, |ext| ext != "raw") {
            continue;
        }
        let Some(tid) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok())
        else {
            bail!("raw file {} is not named <tid>.raw", path.display());
        };
        let input = File::open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let out_path = args.outdir.join(format!("{tid}.trace"));
        let output = File::create(&out_path)
            .with_context(|| format!("creating {}", out_path.display()))?;
        inputs.push(ThreadInput {
            tid,
            input: Box::new(BufReader::new(input)) as Box<dyn Read + Send>,
            sink: Box::new(StreamSink(BufWriter::new(output))),
        });
    }
    if inputs.is_empty() {
        bail!("no .raw files under {}", args.indir.display());
    }
    inputs.sort_by_key(|input| input.tid);
    Ok(inputs)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let (mapper, decoder) = load_modules(&args.modmap)?;
    info!(modules = mapper.len(), "module table loaded");

    let mut config = ConvertConfig {
        chunk_instr_count: args.chunk_instr_count,
        best_effort: args.best_effort,
        max_discontinuities_per_error: args.max_discontinuities_per_error,
        ..ConvertConfig::default()
    };
    if let Some(jobs) = args.jobs {
        config.worker_count = jobs.max(1);
    }

    let mut converter = Converter::new(Arc::new(mapper), Arc::new(decoder), config);
    if let Some(path) = &args.syscall_templates {
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let templates = SyscallTemplates::load(&bytes)
            .with_context(|| format!("parsing {}", path.display()))?;
        info!(templates = templates.len(), "syscall templates loaded");
        converter = converter.with_templates(Arc::new(templates));
    }

    std::fs::create_dir_all(&args.outdir)
        .with_context(|| format!("creating {}", args.outdir.display()))?;
    let inputs = collect_inputs(&args)?;
    info!(threads = inputs.len(), "starting conversion");

    let output = converter.convert(inputs)?;

    if args.schedule {
        let serial_path = args.outdir.join("serial.schedule");
        let mut serial = BufWriter::new(
            File::create(&serial_path)
                .with_context(|| format!("creating {}", serial_path.display()))?,
        );
        output.schedule.write_serial(&mut serial)?;
        for cpu in output.schedule.cpus() {
            let cpu_path = args.outdir.join(format!("cpu-{cpu}.schedule"));
            let mut out = BufWriter::new(
                File::create(&cpu_path)
                    .with_context(|| format!("creating {}", cpu_path.display()))?,
            );
            output.schedule.write_cpu(cpu, &mut out)?;
        }
    }

    for (name, statistic) in [
        ("instructions", Statistic::FinalTraceInstructionCount),
        ("elided addresses", Statistic::CountElided),
        ("rseq aborts", Statistic::RseqAbort),
        ("rseq side exits", Statistic::RseqSideExit),
        ("duplicate syscalls", Statistic::DuplicateSyscall),
        ("false syscalls", Statistic::FalseSyscall),
        ("syscall traces injected", Statistic::SyscallTracesInjected),
        ("syscall traces converted", Statistic::SyscallTracesConverted),
        (
            "syscall conversions failed",
            Statistic::SyscallTracesConversionFailed,
        ),
        (
            "syscall conversions empty",
            Statistic::SyscallTracesConversionEmpty,
        ),
        ("kernel instructions", Statistic::KernelInstrCount),
    ] {
        println!("{name}: {}", output.get_statistic(statistic));
    }
    println!(
        "timestamps: {} .. {}",
        output.get_statistic(Statistic::EarliestTraceTimestamp),
        output.get_statistic(Statistic::LatestTraceTimestamp)
    );
    Ok(())
}
