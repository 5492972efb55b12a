//! Out-of-band hook execution: a named function list from the manifest's
//! `hooks` mapping, run over one package with the same chain machinery as
//! the pipeline. Hooks do not recurse into sub-packages.

use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{Error, Result};
use crate::fnruntime::runner::FnRole;
use crate::hydrate::{pipeline, HydrationContext, HydrationOptions, OutputMode, RenderOutcome};
use crate::pkg::manifest::Function;
use crate::pkg::Package;
use crate::resource::{reader, validate_path, writer};
use crate::results::SharedResults;

/// Run the hook named `name` on the package at `root`.
pub async fn run_hook(
    root: &Path,
    name: &str,
    opts: HydrationOptions,
    results: SharedResults,
) -> Result<RenderOutcome> {
    let root = root
        .canonicalize()
        .map_err(|e| Error::Config(format!("{}: {}", root.display(), e)))?;
    let mut ctx = HydrationContext::new(root.clone(), opts.runtime, results.clone());

    let outcome = run_hook_inner(&root, name, opts.output, &mut ctx).await;

    if let Some(dir) = &opts.results_dir {
        if let Err(e) = results.lock().unwrap().write(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to write results");
        }
    }
    outcome.map(|_| RenderOutcome {
        deferred_failure: ctx.deferred_failure,
    })
}

async fn run_hook_inner(
    root: &Path,
    name: &str,
    output: OutputMode,
    ctx: &mut HydrationContext,
) -> Result<()> {
    let pkg = Package::open(root, root)?;
    let functions = pkg.manifest.hooks.get(name).cloned().ok_or_else(|| {
        Error::Config(format!(
            "package {:?} declares no hook named {:?}",
            pkg.display_path, name
        ))
    })?;
    tracing::info!(package = %pkg.display_path, hook = %name, functions = functions.len(), "running hook");

    let excluded: BTreeSet<String> = functions
        .iter()
        .filter_map(|f| f.config_path.as_deref())
        .filter_map(|p| validate_path(p).ok())
        .collect();
    let input = reader::read_package(&pkg.abs_path, &excluded)?;
    for node in &input {
        ctx.read_files.insert(node.path.clone());
    }

    let chain: Vec<(FnRole, Function)> = functions
        .into_iter()
        .map(|f| (FnRole::Mutator, f))
        .collect();
    let stream = pipeline::run_chain(&pkg, &chain, input, ctx).await?;

    match output {
        OutputMode::Stdout => print!("{}", writer::render_stream(&stream)?),
        OutputMode::InPlace => {
            let written = writer::write_package(root, &stream)?;
            writer::remove_stale(root, &ctx.read_files, &written)?;
        }
    }
    Ok(())
}
