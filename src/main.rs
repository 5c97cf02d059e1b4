#![doc = include_str!(concat!("../", std::env!("CARGO_PKG_README")))]

use std::path::PathBuf;
use std::process::ExitCode;

use aqueduct::engine::metadata::MetadataState;
use aqueduct::engine::{RuntimeConfig, RuntimeContext};
use aqueduct::mro::ast::Expr;
use aqueduct::mro::json::JsonAstParser;
use aqueduct::{AqueductError, engine, mro};
use clap::Parser;

/// Aqueduct is a pipeline runtime for declarative scientific workflows.
#[derive(clap::Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Compile an invocation source and print its canonical formatting.
    Check(CompileArgs),
    /// Print the canonical formatting of an invocation source.
    Fmt(CompileArgs),
    /// Invoke (or reattach to) a pipestance and drive it to completion.
    Run(RunArgs),
}

#[derive(clap::Args)]
struct CompileArgs {
    /// The invocation source (a JSON ast document).
    file: PathBuf,
    /// Additional search paths for includes and stage code.
    #[arg(long = "mropath")]
    mro_paths: Vec<PathBuf>,
    /// Verify that stage source paths exist.
    #[arg(long)]
    check_src: bool,
}

#[derive(clap::Args)]
struct RunArgs {
    /// The invocation source (a JSON ast document).
    file: PathBuf,
    /// The pipestance instance id; also names the output directory.
    psid: String,
    /// Parent directory for the pipestance (defaults to the working
    /// directory).
    #[arg(long)]
    output: Option<PathBuf>,
    /// Additional search paths for includes and stage code.
    #[arg(long = "mropath")]
    mro_paths: Vec<PathBuf>,
    /// Job mode: `local` or a cluster mode from the job manager
    /// configuration.
    #[arg(long, default_value = "local")]
    jobmode: String,
    /// Cap on local threads.
    #[arg(long)]
    localcores: Option<usize>,
    /// Cap on local memory, in GB.
    #[arg(long)]
    localmem: Option<usize>,
    /// Override for the job manager configuration document.
    #[arg(long)]
    jobmanager_config: Option<PathBuf>,
    /// Cluster submission-script template.
    #[arg(long)]
    template: Option<PathBuf>,
    /// Handler to run when the pipestance reaches a terminal state.
    #[arg(long)]
    onfinish: Option<String>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return match error.kind() {
                clap::error::ErrorKind::DisplayHelp
                | clap::error::ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(EXIT_USAGE),
            };
        }
    };
    env_logger::init();

    let result = match cli.command {
        Command::Check(args) => compile(&args, true),
        Command::Fmt(args) => compile(&args, false),
        Command::Run(args) => run(args),
    };
    match result {
        Ok(code) => code,
        Err(error) => {
            // Errors that escape the subcommands keep their kind's code:
            // compile errors exit 2, everything runtime exits 3.
            let code = match &error {
                AqueductError::Compile { .. } => EXIT_COMPILE,
                AqueductError::Runtime(_) => EXIT_RUNTIME,
            };
            eprintln!("{:?}", miette::Report::new(error));
            ExitCode::from(code)
        }
    }
}

/// Exit code for argument and usage errors.
const EXIT_USAGE: u8 = 1;
/// Exit code for compile errors.
const EXIT_COMPILE: u8 = 2;
/// Exit code for runtime failures.
const EXIT_RUNTIME: u8 = 3;

fn compile(args: &CompileArgs, check_src: bool) -> Result<ExitCode, AqueductError> {
    match mro::compile_file(
        &JsonAstParser,
        &args.file,
        &args.mro_paths,
        check_src && args.check_src,
    ) {
        Ok(result) => {
            print!("{}", result.formatted);
            Ok(ExitCode::SUCCESS)
        }
        Err(errors) => {
            eprintln!("{:?}", miette::Report::new(AqueductError::from(errors)));
            Ok(ExitCode::from(EXIT_COMPILE))
        }
    }
}

fn run(args: RunArgs) -> Result<ExitCode, AqueductError> {
    let compiled = match mro::compile_file(&JsonAstParser, &args.file, &args.mro_paths, false) {
        Ok(compiled) => compiled,
        Err(errors) => {
            eprintln!("{:?}", miette::Report::new(AqueductError::from(errors)));
            return Ok(ExitCode::from(EXIT_COMPILE));
        }
    };

    let parent = match args.output {
        Some(output) => output,
        None => std::env::current_dir().map_err(engine::RuntimeError::from)?,
    };
    let path = parent.join(&args.psid);

    let config = RuntimeConfig {
        job_mode: args.jobmode.clone(),
        mro_paths: args.mro_paths.clone(),
        max_cores: args.localcores,
        max_mem_gb: args.localmem,
        jobmanager_config: args.jobmanager_config,
        submit_template: args.template,
        on_finish: args.onfinish,
        ..RuntimeConfig::default()
    };
    let mut rt = RuntimeContext::new(config)?;

    let mut pipestance =
        engine::pipestance::Pipestance::new(&compiled.ast, &args.psid, &path, &args.mro_paths)?;

    let reattaching = path.join("_jobmode").exists();
    if reattaching {
        log::info!("reattaching to pipestance at {}", path.display());
        pipestance.verify_job_mode(&args.jobmode)?;
    } else {
        let invocation = invocation_record(&compiled.ast);
        pipestance.create_dirs(&args.jobmode, &invocation)?;
    }
    pipestance.lock()?;
    if reattaching {
        pipestance.load_metadata();
        pipestance.restart_local_jobs(&rt, &args.jobmode)?;
        pipestance.restart_running_nodes(&args.jobmode)?;
    }

    let state = engine::run(&mut pipestance, &mut rt)?;
    if state == MetadataState::Failed {
        let (transient, first_log) = pipestance.is_error_transient();
        if let Some(fatal) = pipestance.get_fatal_error() {
            eprintln!("pipestance failed at {}", fatal.fq_name);
            eprintln!("{}", fatal.summary);
            for file in &fatal.paths {
                eprintln!("see {file}");
            }
        }
        if transient && !first_log.is_empty() {
            eprintln!("the error looks transient ({first_log}); rerunning may succeed");
        }
        return Ok(ExitCode::from(EXIT_RUNTIME));
    }
    println!("pipestance {} is {}", args.psid, state.as_str());
    Ok(ExitCode::SUCCESS)
}

/// Record the invocation for the pipestance directory: the callee plus the
/// literal value of every binding.
fn invocation_record(ast: &aqueduct::mro::ast::Ast) -> serde_json::Value {
    let Some(call) = &ast.call else {
        return serde_json::Value::Null;
    };
    let mut values = serde_json::Map::new();
    let mut sweeps = Vec::new();
    for bind in &call.bindings.list {
        match &bind.expr {
            Expr::Literal { value, .. } => {
                values.insert(bind.id.to_string(), value.to_json());
            }
            Expr::Sweep { values: swept, .. } => {
                sweeps.push(serde_json::Value::from(bind.id.to_string()));
                let rendered: Vec<serde_json::Value> = swept
                    .iter()
                    .filter_map(|expr| match expr {
                        Expr::Literal { value, .. } => Some(value.to_json()),
                        _ => None,
                    })
                    .collect();
                values.insert(bind.id.to_string(), serde_json::Value::Array(rendered));
            }
            Expr::Ref(_) => {}
        }
    }
    serde_json::json!({
        "call": &*call.dec_id,
        "args": values,
        "sweepargs": sweeps,
    })
}
