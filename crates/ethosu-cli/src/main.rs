use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::{Context, IntoDiagnostic};

use ethosu_backend::EthosUBackend;
use ethosu_backend_core::{AcceleratorVariant, BackendRegistry, HardwareConfig, LoweredProgram, MemoryArea};
use ethosu_compare::{CompareOptions, Model, build_graph, calibrate, compare_with_reference};
use ethosu_opt::OptLevel;
use ethosu_partition::{EthosUSupport, partition};

/// Ethos-U pipeline driver: partition, compile and compare single-operator models
#[derive(Parser)]
#[command(name = "ethosu", version, about)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the accelerator variants and models
    Targets,
    /// Partition and compile a model for one variant
    Compile(CompileArgs),
    /// Compare a model against the reference on one or all variants
    Compare(CompareArgs),
}

#[derive(Args)]
struct ModelArgs {
    /// Operator model (see `ethosu targets`)
    #[arg(long)]
    op: Model,

    /// Input shape, comma-separated
    #[arg(long, default_value = "1,8,8,4", value_delimiter = ',')]
    shape: Vec<usize>,

    /// Seed for calibration and test inputs
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Optimization level: 0, 1, or 2
    #[arg(long, default_value = "1", value_parser = parse_opt_level)]
    opt_level: OptLevel,
}

#[derive(Args)]
struct CompileArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Accelerator variant
    #[arg(long, default_value = "ethos-u55-256")]
    accel: String,

    /// Override the SRAM capacity in KiB
    #[arg(long)]
    sram_kib: Option<usize>,

    /// Write the serialized program(s) here
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Dump the partitioned graph to stderr
    #[arg(long)]
    emit_ir: bool,

    /// Print the command stream of every region
    #[arg(long)]
    disasm: bool,
}

#[derive(Args)]
struct CompareArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Accelerator variant, or `all`
    #[arg(long, default_value = "all")]
    accel: String,
}

fn parse_opt_level(s: &str) -> Result<OptLevel, String> {
    match s {
        "0" => Ok(OptLevel::O0),
        "1" => Ok(OptLevel::O1),
        "2" => Ok(OptLevel::O2),
        _ => Err(format!(
            "invalid optimization level '{s}', expected 0, 1, or 2"
        )),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = match cli.command {
        Command::Targets => targets(),
        Command::Compile(args) => compile(args),
        Command::Compare(args) => compare(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn registry(opt_level: OptLevel) -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry.register(Box::new(EthosUBackend::new(opt_level)));
    registry
}

fn targets() -> miette::Result<()> {
    println!("Accelerator variants:");
    for target in registry(OptLevel::default()).list_targets() {
        println!("  {target}");
    }
    println!("Models:");
    for model in Model::ALL {
        println!("  {model}");
    }
    Ok(())
}

fn options(args: &ModelArgs) -> CompareOptions {
    CompareOptions {
        seed: args.seed,
        opt_level: args.opt_level,
        ..Default::default()
    }
}

fn compile(args: CompileArgs) -> miette::Result<()> {
    let model = args.model.op;
    let shapes = model.input_shapes(&args.model.shape);

    // 1. Build and quantize the model.
    let float = build_graph(|b, x| model.build(b, x), &shapes)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to build model '{model}'"))?;
    let graph = calibrate(&float, &shapes, &options(&args.model))
        .into_diagnostic()
        .wrap_err("calibration failed")?;

    // 2. Partition.
    let partitioned = partition(&graph, &EthosUSupport)
        .into_diagnostic()
        .wrap_err("partitioning failed")?;
    if args.emit_ir {
        eprintln!("{}", ethosu_ir::dump_graph(&partitioned));
    }

    // 3. Backend dispatch.
    let registry = registry(args.model.opt_level);
    let backend = registry.find(&args.accel).ok_or_else(|| {
        let available = registry.list_targets().join(", ");
        miette::miette!("unknown target '{}' (available: {})", args.accel, available)
    })?;
    let variant: AcceleratorVariant = args.accel.parse().into_diagnostic()?;
    let mut config = HardwareConfig::for_variant(variant);
    if let Some(kib) = args.sram_kib {
        config = config.with_pool_capacity(MemoryArea::Sram, kib_to_bytes(kib)?);
    }

    // 4. Compile every region.
    let regions = partitioned.regions();
    if regions.is_empty() {
        eprintln!("note: no operator of '{model}' can be offloaded; nothing to compile");
    }
    for (i, region) in regions.iter().enumerate() {
        let sub = partitioned
            .extract_region(*region)
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to extract region {region}"))?;
        let program = backend
            .compile(&sub, &config)
            .into_diagnostic()
            .wrap_err_with(|| format!("compilation of region {region} failed"))?;

        for diag in &program.diagnostics {
            eprintln!("{diag}");
        }
        println!("{region}: {program}");
        if args.disasm {
            let listing = program
                .disassemble()
                .into_diagnostic()
                .wrap_err("failed to decode command stream")?;
            print!("{listing}");
        }
        if let Some(path) = &args.output {
            let path = if regions.len() == 1 {
                path.clone()
            } else {
                suffixed(path, i)
            };
            write_program(&path, &program)?;
        }
    }
    Ok(())
}

fn kib_to_bytes(kib: usize) -> miette::Result<usize> {
    kib.checked_mul(1024)
        .ok_or_else(|| miette::miette!("SRAM size of {kib} KiB does not fit in memory"))
}

/// `out.bin` becomes `out.1.bin` for the second region.
fn suffixed(path: &Path, index: usize) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{index}"),
    };
    path.with_file_name(name)
}

fn write_program(path: &Path, program: &LoweredProgram) -> miette::Result<()> {
    std::fs::write(path, program.to_bytes())
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to write {}", path.display()))?;
    log::info!("wrote {}", path.display());
    Ok(())
}

fn compare(args: CompareArgs) -> miette::Result<()> {
    let model = args.model.op;
    let shapes = model.input_shapes(&args.model.shape);
    let variants: Vec<&str> = if args.accel.eq_ignore_ascii_case("all") {
        AcceleratorVariant::ALL.iter().map(|v| v.name()).collect()
    } else {
        vec![args.accel.as_str()]
    };

    let options = options(&args.model);
    let mut failures = 0;
    for accel in variants {
        match compare_with_reference(|b, x| model.build(b, x), &shapes, accel, &options) {
            Ok(report) => println!("PASS {model} {report}"),
            Err(err) => {
                failures += 1;
                println!("FAIL {model} {accel}: {err}");
            }
        }
    }
    if failures > 0 {
        return Err(miette::miette!("{failures} comparison(s) failed"));
    }
    Ok(())
}
