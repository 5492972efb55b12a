use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

use krm_render::error::Error;
use krm_render::fnruntime::{PullPolicy, RuntimeOptions};
use krm_render::hydrate::{self, HydrationOptions, OutputMode, RenderOutcome};
use krm_render::results;

/// Configuration hydration engine for declarative KRM packages
#[derive(Parser, Debug)]
#[command(
    name = "krm-render",
    version,
    about = "Configuration hydration engine for declarative KRM packages",
    long_about = "Reads a package (and its nested sub-packages), executes the pipeline of mutator and validator functions declared in each package manifest, and writes the hydrated resources back in place, preserving comments, field order, and file locations."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Hydrate a package tree
    Render(RenderArgs),
    /// Run a named hook on a single package
    Hook(HookArgs),
}

#[derive(Args, Debug)]
struct RenderArgs {
    /// Package directory (defaults to the current directory)
    pkg: Option<PathBuf>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct HookArgs {
    /// Hook name, as declared under `hooks:` in the package manifest
    name: String,

    /// Package directory (defaults to the current directory)
    pkg: Option<PathBuf>,

    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Directory to write the aggregated results.yaml into
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Permit functions declared with `exec:`
    #[arg(long)]
    allow_exec: bool,

    /// When to pull function images: always, ifNotPresent, or never
    #[arg(long, default_value = "ifNotPresent")]
    image_pull_policy: String,

    /// Allow functions that declare `network: true` to reach the network
    #[arg(long)]
    network: bool,

    /// Run container functions as the invoking user instead of nobody
    #[arg(long)]
    as_current_user: bool,

    /// Storage mount for container functions (type=bind,src=...,dst=...);
    /// repeatable
    #[arg(long = "mount")]
    mounts: Vec<String>,

    /// Per-function timeout in seconds
    #[arg(long, default_value_t = 300)]
    fn_timeout: u64,

    /// Print the hydrated stream to stdout instead of writing in place
    #[arg(long)]
    output_stdout: bool,

    /// Print full function stderr instead of the last 4 lines
    #[arg(long)]
    full_stderr: bool,
}

impl CommonArgs {
    fn hydration_options(&self) -> anyhow::Result<HydrationOptions> {
        let pull_policy: PullPolicy = self
            .image_pull_policy
            .parse()
            .context("invalid --image-pull-policy")?;
        for mount in &self.mounts {
            if !mount.starts_with("type=") {
                bail!(
                    "invalid mount {:?}: expected type=bind|volume|tmpfs,src=...,dst=...",
                    mount
                );
            }
        }
        Ok(HydrationOptions {
            runtime: RuntimeOptions {
                pull_policy,
                allow_exec: self.allow_exec,
                network_enabled: self.network,
                as_current_user: self.as_current_user,
                mounts: self.mounts.clone(),
                timeout: Duration::from_secs(self.fn_timeout),
            },
            results_dir: self.results_dir.clone(),
            output: if self.output_stdout {
                OutputMode::Stdout
            } else {
                OutputMode::InPlace
            },
        })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing with appropriate level
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let common = match &cli.command {
        Command::Render(args) => &args.common,
        Command::Hook(args) => &args.common,
    };
    let full_stderr = common.full_stderr;
    let results_dir = common.results_dir.clone();

    let opts = match common.hydration_options() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("{:#}", e);
            std::process::exit(1);
        }
    };

    let results = results::shared();
    let run = async {
        match &cli.command {
            Command::Render(args) => {
                let pkg = args.pkg.clone().unwrap_or_else(|| PathBuf::from("."));
                hydrate::render(&pkg, opts, results.clone()).await
            }
            Command::Hook(args) => {
                let pkg = args.pkg.clone().unwrap_or_else(|| PathBuf::from("."));
                hydrate::hooks::run_hook(&pkg, &args.name, opts, results.clone()).await
            }
        }
    };

    // Dropping the in-flight future on Ctrl-C tears down any child
    // process; partial results are flushed below.
    let outcome = tokio::select! {
        outcome = run => outcome,
        _ = tokio::signal::ctrl_c() => Err(Error::Cancelled),
    };

    match outcome {
        Ok(RenderOutcome {
            deferred_failure: false,
        }) => {}
        Ok(RenderOutcome {
            deferred_failure: true,
        }) => {
            eprintln!("one or more functions failed (deferred)");
            std::process::exit(1);
        }
        Err(e) => {
            report_failure(&e, full_stderr);
            if matches!(e, Error::Cancelled) {
                if let Some(dir) = &results_dir {
                    let _ = results.lock().unwrap().write(dir);
                }
            }
            std::process::exit(1);
        }
    }
}

fn report_failure(error: &Error, full_stderr: bool) {
    match error {
        Error::Function(failure) => {
            eprint!("{}", failure.render(full_stderr));
        }
        other => eprintln!("{}", other),
    }
}
