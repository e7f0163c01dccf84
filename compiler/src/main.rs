use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use fgc::error::ImportError;
use fgc::import::{import_graph, GraphDescription};
use fgc::jit::{OptLevel, Value};
use fgc::pipeline::{compile, compute_provenance, CompileOptions, DEFAULT_ENTRY};
use fgc::registry::{register_builtins, NodeRegistry};
use fgc::types::{CoreTypes, TypeRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitStage {
    Run,
    Ir,
    Signature,
    Deps,
    Dot,
    BuildInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Opt {
    None,
    Speed,
    SpeedAndSize,
}

impl From<Opt> for OptLevel {
    fn from(opt: Opt) -> Self {
        match opt {
            Opt::None => OptLevel::None,
            Opt::Speed => OptLevel::Speed,
            Opt::SpeedAndSize => OptLevel::SpeedAndSize,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "fgc",
    version,
    about = "Function Graph Compiler — JIT-compiles node graph descriptions into native functions"
)]
struct Cli {
    /// Graph description (JSON)
    graph: PathBuf,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Run)]
    emit: EmitStage,

    /// Input value, in interface order (repeatable; vectors as x,y,z)
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Exported symbol name
    #[arg(long, default_value = DEFAULT_ENTRY)]
    entry: String,

    /// Backend optimization level
    #[arg(long, value_enum, default_value_t = Opt::Speed)]
    opt: Opt,

    /// Log compiler phases and per-node emission
    #[arg(long)]
    verbose: bool,
}

/// Exit code 1: the graph is at fault. Exit code 2: I/O or usage.
enum Failure {
    Graph,
    Usage,
}

impl Failure {
    fn exit_code(&self) -> ExitCode {
        match self {
            Failure::Graph => ExitCode::from(1),
            Failure::Usage => ExitCode::from(2),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => failure.exit_code(),
    }
}

fn run(cli: &Cli) -> Result<(), Failure> {
    // ── Registries ──
    let types = TypeRegistry::with_builtins();
    let core = CoreTypes::from_registry(&types).map_err(|e| {
        eprintln!("fgc: error: {}", e);
        Failure::Graph
    })?;
    let mut registry = NodeRegistry::new();
    register_builtins(&mut registry, &core).map_err(|e| {
        eprintln!("fgc: error: {}", e);
        Failure::Graph
    })?;

    // ── Read source ──
    let source = std::fs::read_to_string(&cli.graph).map_err(|e| {
        eprintln!("fgc: error: {}: {}", cli.graph.display(), e);
        Failure::Usage
    })?;

    if cli.emit == EmitStage::BuildInfo {
        print!("{}", compute_provenance(&source, &registry).to_json());
        return Ok(());
    }

    // ── Import ──
    let description = GraphDescription::from_json(&source).map_err(|e| {
        eprintln!("fgc: error: {}: {}", cli.graph.display(), e);
        Failure::Graph
    })?;
    let imported = match import_graph(&description, &registry) {
        Ok(imported) => imported,
        Err(ImportError::Rejected { diagnostics }) => {
            for diag in &diagnostics {
                eprintln!("fgc: {}", diag);
            }
            return Err(Failure::Graph);
        }
        Err(e) => {
            eprintln!("fgc: error: {}", e);
            return Err(Failure::Graph);
        }
    };
    let function = &imported.function;

    match cli.emit {
        EmitStage::Dot => {
            print!("{}", fgc::dot::emit_function_dot(function));
            return Ok(());
        }
        EmitStage::Deps => {
            let deps = function.dependencies().map_err(|e| {
                eprintln!("fgc: error: {}", e);
                Failure::Graph
            })?;
            for dep in deps {
                println!("{}", dep);
            }
            return Ok(());
        }
        _ => {}
    }

    // ── Compile ──
    let options = CompileOptions {
        opt_level: cli.opt.into(),
        keep_ir: cli.emit == EmitStage::Ir,
        entry_name: cli.entry.clone(),
        ..CompileOptions::default()
    };
    let compiled = options
        .machine_context()
        .and_then(|context| compile(function, &context, &options))
        .map_err(|e| {
            eprintln!("fgc: error: {}", e);
            Failure::Graph
        })?;

    match cli.emit {
        EmitStage::Signature => println!("{}", compiled.signature()),
        EmitStage::Ir => print!("{}", compiled.ir().unwrap_or_default()),
        _ => {
            if cli.args.len() != compiled.inputs().len() {
                eprintln!(
                    "fgc: error: graph takes {} arguments, {} given",
                    compiled.inputs().len(),
                    cli.args.len()
                );
                return Err(Failure::Usage);
            }
            let mut args = Vec::with_capacity(cli.args.len());
            for (text, info) in cli.args.iter().zip(compiled.inputs()) {
                let value = Value::parse(text, &info.ty).ok_or_else(|| {
                    eprintln!("fgc: error: '{}' is not a valid {} for '{}'", text, info.ty, info.name);
                    Failure::Usage
                })?;
                args.push(value);
            }
            let results = compiled.call(&args).map_err(|e| {
                eprintln!("fgc: error: {}", e);
                Failure::Usage
            })?;
            for (info, value) in compiled.outputs().iter().zip(results) {
                println!("{} = {}", info.name, value);
            }
        }
    }
    Ok(())
}
