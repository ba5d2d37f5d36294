use anyhow::{anyhow, Context, Result};
use carbonloop::config::{Config, API_KEY_ENV};
use carbonloop::extract::extract_functions;
use carbonloop::llm::{LlmImprover, LlmSpecResolver, Model, OpenRouterClient};
use carbonloop::optimize::{
    assemble_output, default_output_path, summarize, write_artifact, Driver, ProgressEvent,
    RunContext, RunSettings,
};
use carbonloop::oracle::{ExistingTestsResolver, Oracles, SpecResolver};
use carbonloop::report::{render_summary, report_path, write_report_json, ConsoleReporter, RunReport};
use carbonloop::sandbox::{CodeCarbonProfiler, PythonTestOracle, SandboxSession};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const LOG_ENV: &str = "CARBONLOOP_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "carbonloop",
    about = "Rewrite Python functions for lower energy cost, keeping only rewrites that pass tests",
    version
)]
struct Cli {
    /// More diagnostics on stderr (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Optimize every top-level function in a Python file
    Run(RunArgs),
    /// Store the OpenRouter API key in the system keychain
    SetKey(SetKeyArgs),
    /// Write a config file with default values if none exists
    InitConfig,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Python source file to optimize
    input: PathBuf,
    /// Existing test file to draw tests from
    #[arg(long)]
    tests: Option<PathBuf>,
    /// Where to write the optimized file (default: <stem>_optimized.py)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Write a JSON run report, optionally to PATH
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    report: Option<Option<PathBuf>>,
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Calls per profiler run
    #[arg(long)]
    iterations: Option<u64>,
    /// Python interpreter used for tests and profiling
    #[arg(long)]
    python: Option<PathBuf>,
    #[arg(long, value_enum)]
    model: Option<Model>,
    #[arg(long, value_name = "SECS")]
    test_timeout: Option<u64>,
    #[arg(long, value_name = "SECS")]
    profile_timeout: Option<u64>,
    /// Hand the --tests file to every function as-is instead of asking the model
    #[arg(long, requires = "tests")]
    reuse_tests: bool,
    /// Keep generated scripts after the run
    #[arg(long)]
    keep_sandbox: bool,
}

#[derive(Args, Debug)]
struct SetKeyArgs {
    key: String,
}

/// Config file values with command-line overrides applied.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedRun {
    settings: RunSettings,
    model: Model,
    test_timeout: Duration,
    profile_timeout: Duration,
    llm_timeout: Duration,
    keep_sandbox: bool,
}

fn resolve_run(args: &RunArgs, config: &Config) -> ResolvedRun {
    ResolvedRun {
        settings: RunSettings {
            max_attempts: args.max_attempts.unwrap_or(config.max_attempts),
            iterations: args.iterations.unwrap_or(config.iterations),
            runtime: args.python.clone().unwrap_or_else(|| config.python.clone()),
        },
        model: args.model.unwrap_or(config.model),
        test_timeout: Duration::from_secs(args.test_timeout.unwrap_or(config.test_timeout_secs)),
        profile_timeout: Duration::from_secs(
            args.profile_timeout.unwrap_or(config.profile_timeout_secs),
        ),
        llm_timeout: Duration::from_secs(config.llm_timeout_secs),
        keep_sandbox: args.keep_sandbox || config.keep_sandbox,
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::SetKey(args) => set_key(args),
        Commands::InitConfig => init_config(),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let started_at = Utc::now();
    let run_id = Uuid::new_v4().to_string();
    let resolved = resolve_run(&args, &Config::load());
    tracing::info!(run_id = %run_id, ?resolved, "starting run");

    let source = std::fs::read_to_string(&args.input)
        .with_context(|| format!("Failed to read '{}'", args.input.display()))?;
    let raw_tests = match &args.tests {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read tests '{}'", path.display()))?,
        ),
        None => None,
    };

    println!("Extracting functions from {}...", args.input.display());
    let extracted = extract_functions(&source)?;
    if extracted.functions.is_empty() {
        println!("No functions found in the input file. Nothing to optimize.");
    } else {
        let names = extracted
            .functions
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        println!("Found {} function(s): {}", extracted.functions.len(), names);
    }

    let api_key = match Config::get_api_key() {
        Some(key) => key,
        None if extracted.functions.is_empty() => String::new(),
        None => {
            return Err(anyhow!(
                "No API key configured. Set {} or run 'carbonloop set-key <KEY>'.",
                API_KEY_ENV
            ))
        }
    };

    let workdir = input_dir(&args.input);
    let session = Arc::new(SandboxSession::create(&run_id, resolved.keep_sandbox)?);
    let client = Arc::new(OpenRouterClient::new(
        api_key,
        resolved.model,
        resolved.llm_timeout,
    )?);
    let meter = client.meter();

    let spec: Box<dyn SpecResolver> = if args.reuse_tests {
        Box::new(ExistingTestsResolver)
    } else {
        Box::new(LlmSpecResolver::new(Arc::clone(&client)))
    };
    let oracles = Oracles {
        spec,
        improver: Box::new(LlmImprover::new(Arc::clone(&client))),
        tests: Box::new(PythonTestOracle::new(
            Arc::clone(&session),
            resolved.settings.runtime.clone(),
            workdir.clone(),
            resolved.test_timeout,
        )),
        profiler: Box::new(CodeCarbonProfiler::new(
            Arc::clone(&session),
            workdir,
            resolved.profile_timeout,
        )),
    };

    let context = RunContext::new(
        &args.input,
        extracted.functions,
        extracted.preamble,
        raw_tests,
        resolved.settings.clone(),
    );
    let driver = Driver::new(context, oracles);

    let mut reporter = ConsoleReporter::stdout();
    let outcome = driver
        .run(&mut |event: &ProgressEvent<'_>| reporter.observe(event))
        .await
        .map_err(|err| {
            tracing::error!(kind = err.kind(), "run aborted");
            err
        })?;

    let output_path = args
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(driver.context().input_path()));
    let assembled = assemble_output(driver.context(), &outcome.results);
    write_artifact(&output_path, &assembled)?;

    let summary = summarize(driver.context(), &outcome.results);
    let (calls, usage) = meter.snapshot();
    println!();
    println!("{}", render_summary(&summary, Some((calls, &usage))));
    println!("Written optimized file to {}", output_path.display());

    if let Some(requested) = &args.report {
        let path = report_path(requested.as_deref(), &args.input, &run_id);
        let report = RunReport::new(
            &run_id,
            started_at,
            &args.input,
            &output_path,
            resolved.model.id(),
            &resolved.settings,
            outcome.outcomes,
            summary,
            (calls, usage),
        );
        write_report_json(&path, &report)?;
        println!("Report: {}", path.display());
    }

    Ok(())
}

/// Directory the input lives in; candidates run from there so relative
/// imports and data paths resolve as they would for the original file.
fn input_dir(input: &Path) -> PathBuf {
    let dir = input
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf())
}

fn set_key(args: SetKeyArgs) -> Result<()> {
    let key = args.key.trim();
    if key.is_empty() {
        return Err(anyhow!("No API key provided"));
    }
    if !Config::validate_api_key_format(key) {
        println!("  Warning: Key doesn't look like an OpenRouter key (should start with sk-)");
        println!("     Saving anyway...");
    }
    Config::set_api_key(key).map_err(|e| anyhow!(e))?;
    println!("  + API key saved to the system keychain");
    Ok(())
}

fn init_config() -> Result<()> {
    let path = Config::config_path().ok_or_else(|| anyhow!("Could not determine config directory"))?;
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    Config::default().save().map_err(|e| anyhow!(e))?;
    println!("  + Wrote default config to {}", Config::config_location());
    Ok(())
}
