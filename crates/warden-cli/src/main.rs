//! Warden CLI - run untrusted programs under confinement
//!
//! Usage:
//!   warden assemble     - Assemble a program into class images
//!   warden disassemble  - Show a program, optionally after instrumentation
//!   warden run          - Run a program in the sandbox

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warden_core::{Engine, EngineConfig, RunRequest};
use warden_sandbox::{
    assemble, disassemble, ClassFile, CompiledUnit, EntryPoint, ExecutionResult, Permission,
    PermissionSet,
};
use warden_trace::{ExecutionStep, LineTrace, MethodTrace};

#[derive(Parser)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Confined execution engine for untrusted programs", long_about = None)]
struct Cli {
    /// Log sandbox activity (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a program into JSON class images
    Assemble {
        input: PathBuf,

        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the bytecode of a program
    Disassemble {
        input: PathBuf,

        /// Show the code after the configured plugins rewrote it
        #[arg(long)]
        instrumented: bool,

        #[command(flatten)]
        trace: TraceFlags,
    },

    /// Run a program in the sandbox
    Run {
        input: PathBuf,

        /// Entry point as Class.method
        #[arg(long, default_value = "Main.main")]
        entry: String,

        /// Timeout in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Extra threads the program may start
        #[arg(long, default_value_t = 0)]
        threads: usize,

        /// Directory the program may write into
        #[arg(long = "allow-write")]
        allow_write: Vec<PathBuf>,

        /// Environment variable the program may read
        #[arg(long = "allow-env")]
        allow_env: Vec<String>,

        /// Runtime property the program may read
        #[arg(long = "allow-property")]
        allow_property: Vec<String>,

        #[command(flatten)]
        trace: TraceFlags,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct TraceFlags {
    /// Enable the line tracer
    #[arg(long)]
    line_trace: bool,

    /// Enable the method-entry tracer
    #[arg(long)]
    method_trace: bool,

    /// Stop the program after this many traced lines
    #[arg(long)]
    run_line_limit: Option<u64>,
}

impl TraceFlags {
    fn apply(&self, config: &mut EngineConfig) {
        if self.line_trace || self.run_line_limit.is_some() {
            config.plugins.line_trace = true;
        }
        if self.method_trace {
            config.plugins.method_trace = true;
        }
        if let Some(limit) = self.run_line_limit {
            config.plugins.line_trace_arguments.run_line_limit = Some(limit);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let mut config = EngineConfig::load(cli.config.as_deref())?;
    debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Assemble { input, output } => {
            let classes = read_classes(&input)?;
            let json = serde_json::to_string_pretty(&classes)?;
            match output {
                Some(path) => std::fs::write(&path, json)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => println!("{}", json),
            }
        }

        Commands::Disassemble {
            input,
            instrumented,
            trace,
        } => {
            trace.apply(&mut config);
            let compiled = Arc::new(compile(&input)?);
            if instrumented {
                let engine = Engine::new(config)?;
                let unit = engine.load(compiled)?;
                for name in unit.defined_classes() {
                    if let Some(bytes) = unit.instrumented_bytecode(&name) {
                        print!("{}", warden_sandbox::disasm::disassemble_bytes(bytes)?);
                    }
                }
            } else {
                for bytes in compiled.classes().values() {
                    print!("{}", warden_sandbox::disasm::disassemble_bytes(bytes)?);
                }
            }
        }

        Commands::Run {
            input,
            entry,
            timeout,
            threads,
            allow_write,
            allow_env,
            allow_property,
            trace,
            json,
        } => {
            trace.apply(&mut config);
            let (class, method) = entry
                .rsplit_once('.')
                .with_context(|| format!("entry point {} is not Class.method", entry))?;

            let mut permissions = PermissionSet::new();
            for dir in allow_write {
                permissions.grant(Permission::WriteFile(dir));
            }
            for name in allow_env {
                permissions.grant(Permission::EnvVar(name));
            }
            for name in allow_property {
                permissions.grant(Permission::ReadProperty(name));
            }
            if threads > 0 {
                permissions.grant(Permission::CreateThread);
            }

            let mut request = RunRequest::new(Arc::new(compile(&input)?))
                .with_entry(EntryPoint::new(class, method))
                .with_permissions(permissions)
                .with_max_extra_threads(threads);
            if let Some(timeout) = timeout {
                request = request.with_timeout(timeout);
            }

            let engine = Engine::new(config)?;
            let result = engine.run(request).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                report(&result);
            }
            if !result.completed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

/// Classes from assembly text or a JSON class image list
fn read_classes(path: &Path) -> anyhow::Result<Vec<ClassFile>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "json") {
        Ok(serde_json::from_str(&text)?)
    } else {
        Ok(assemble(&text)?)
    }
}

fn compile(path: &Path) -> anyhow::Result<CompiledUnit> {
    let classes = read_classes(path)?;
    if classes.is_empty() {
        bail!("{} defines no classes", path.display());
    }
    let source = classes
        .iter()
        .map(disassemble)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(CompiledUnit::from_classes(classes, &source)?)
}

fn report(result: &ExecutionResult) {
    let output = result.output();
    if !output.is_empty() {
        println!("{}", output);
    }
    if result.truncated_lines > 0 {
        println!("... {} more lines", result.truncated_lines);
    }

    let status = if result.completed {
        "completed"
    } else if result.timed_out {
        "timed out"
    } else if result.killed {
        "killed"
    } else if result.failed {
        "failed"
    } else {
        "denied"
    };
    eprintln!("-- {} in {} ms", status, result.execution_millis);
    if let Some(reason) = &result.kill_reason {
        eprintln!("-- kill reason: {}", reason);
    }
    if let Some(error) = &result.error {
        eprintln!("-- {}: {}", error.kind, error.message);
    }
    for decision in &result.permission_log {
        eprintln!(
            "-- {} {}",
            if decision.granted { "granted" } else { "denied" },
            decision.permission
        );
    }

    if let Some(trace) = result.plugin_results.get::<LineTrace>() {
        eprintln!("-- {} lines run", trace.lines_run);
        for step in &trace.steps {
            eprintln!("   [{}] {}:{}", step.thread_index, step.source, step.line);
        }
    }
    if let Some(trace) = result.plugin_results.get::<MethodTrace>() {
        for step in &trace.steps {
            match step {
                ExecutionStep::Line { source, line } => eprintln!("   {}:{}", source, line),
                ExecutionStep::Enter {
                    method, arguments, ..
                } => {
                    let arguments: Vec<String> = arguments
                        .iter()
                        .map(|a| format!("{}={}", a.name, a.value))
                        .collect();
                    eprintln!("   -> {}({})", method, arguments.join(", "));
                }
            }
        }
    }
}
