//! The recursive hydrator: walks the package tree, hydrates children
//! before parents, and keeps every package in exactly one of three states.
//!
//! A package starts `Dry` (absent from the state map), moves to
//! `Hydrating` on entry, and to `Wet` with its memoised output on success.
//! Re-entering a package that is still `Hydrating` means the sub-package
//! graph has a cycle, which is fatal.

pub mod hooks;
pub mod pipeline;

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use crate::condition::ConditionEvaluator;
use crate::error::{Error, Result};
use crate::fnruntime::RuntimeOptions;
use crate::image::TagResolver;
use crate::pkg::Package;
use crate::resource::{reader, writer, ResourceNode};
use crate::results::SharedResults;

/// Where the hydrated stream goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Write files back in place under the hydration root.
    #[default]
    InPlace,
    /// Print the stream to stdout and leave the filesystem alone.
    Stdout,
}

/// Caller-facing knobs for one hydration run.
pub struct HydrationOptions {
    pub runtime: RuntimeOptions,
    pub results_dir: Option<PathBuf>,
    pub output: OutputMode,
}

impl Default for HydrationOptions {
    fn default() -> Self {
        HydrationOptions {
            runtime: RuntimeOptions::default(),
            results_dir: None,
            output: OutputMode::default(),
        }
    }
}

/// What the caller learns beyond success: whether some function failed
/// with `deferFailure` set (the run still exits non-zero).
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOutcome {
    pub deferred_failure: bool,
}

/// Hydration state of one discovered package. `Dry` is represented by
/// absence from the state map.
enum PkgState {
    Hydrating,
    Wet(Vec<ResourceNode>),
}

/// State owned by one hydration run, shared across all packages.
pub struct HydrationContext {
    pub root: PathBuf,
    pub opts: RuntimeOptions,
    pub results: SharedResults,
    pub condition: ConditionEvaluator,
    pub resolver: TagResolver,
    seen: HashMap<PathBuf, PkgState>,
    pub(crate) runtime_checked: bool,
    pub deferred_failure: bool,
    /// Root-relative paths of every file read, for stale-file cleanup.
    pub read_files: BTreeSet<String>,
}

impl HydrationContext {
    pub fn new(root: PathBuf, opts: RuntimeOptions, results: SharedResults) -> Self {
        HydrationContext {
            root,
            opts,
            results,
            condition: ConditionEvaluator::new(),
            resolver: TagResolver::registry(),
            seen: HashMap::new(),
            runtime_checked: false,
            deferred_failure: false,
            read_files: BTreeSet::new(),
        }
    }
}

/// Hydrate the package tree rooted at `root` and flush the output.
///
/// The result list is written to the results directory whether the run
/// succeeds or fails; on cancellation the caller flushes it instead.
pub async fn render(
    root: &Path,
    opts: HydrationOptions,
    results: SharedResults,
) -> Result<RenderOutcome> {
    let root = root
        .canonicalize()
        .map_err(|e| Error::Config(format!("{}: {}", root.display(), e)))?;
    let mut ctx = HydrationContext::new(root.clone(), opts.runtime, results.clone());

    let outcome = render_inner(&root, opts.output, &mut ctx).await;

    if let Some(dir) = &opts.results_dir {
        if let Err(e) = results.lock().unwrap().write(dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to write results");
        }
    }
    outcome.map(|_| RenderOutcome {
        deferred_failure: ctx.deferred_failure,
    })
}

async fn render_inner(root: &Path, output: OutputMode, ctx: &mut HydrationContext) -> Result<()> {
    let stream = hydrate(ctx, root).await?;
    match output {
        OutputMode::Stdout => {
            print!("{}", writer::render_stream(&stream)?);
        }
        OutputMode::InPlace => {
            let written = writer::write_package(root, &stream)?;
            writer::remove_stale(root, &ctx.read_files, &written)?;
        }
    }
    Ok(())
}

/// Hydrate one package: children first, then the local resources, then the
/// package's own pipeline. Returns the package's full output stream with
/// paths rewritten relative to the hydration root.
fn hydrate<'a>(
    ctx: &'a mut HydrationContext,
    pkg_path: &'a Path,
) -> Pin<Box<dyn Future<Output = Result<Vec<ResourceNode>>> + 'a>> {
    Box::pin(async move {
        let canon = pkg_path
            .canonicalize()
            .map_err(|e| Error::Config(format!("{}: {}", pkg_path.display(), e)))?;
        match ctx.seen.get(&canon) {
            Some(PkgState::Hydrating) => {
                return Err(Error::Cycle(display_path(&ctx.root, &canon)))
            }
            Some(PkgState::Wet(cached)) => return Ok(cached.clone()),
            None => {}
        }
        ctx.seen.insert(canon.clone(), PkgState::Hydrating);

        let pkg = Package::open(&canon, &ctx.root)?;
        tracing::info!(package = %pkg.display_path, "hydrating package");

        let mut input = Vec::new();
        for child in pkg.direct_subpackages()? {
            input.extend(hydrate(ctx, &child).await?);
        }

        let excluded = pkg.manifest.fn_config_paths();
        let local = reader::read_package(&pkg.abs_path, &excluded)?;
        let rel = pkg.rel_to(&ctx.root);
        for node in &local {
            ctx.read_files.insert(join_rel(&rel, &node.path));
        }
        input.extend(local);

        let output = pipeline::run_pipeline(&pkg, input, ctx).await?;
        let output = rewrite_paths(output, &rel);

        ctx.seen.insert(canon, PkgState::Wet(output.clone()));
        Ok(output)
    })
}

/// Left-join each node's path with the package's position under the
/// hydration root, unless a deeper package already prefixed it. Invariant
/// checks ran on the pre-rewrite paths, so rewriting cannot re-introduce
/// an escape.
fn rewrite_paths(mut nodes: Vec<ResourceNode>, rel: &str) -> Vec<ResourceNode> {
    if rel.is_empty() {
        return nodes;
    }
    let prefix = format!("{}/", rel);
    for node in &mut nodes {
        if !node.path.starts_with(&prefix) {
            node.path = format!("{}{}", prefix, node.path);
        }
    }
    nodes
}

fn join_rel(rel: &str, path: &str) -> String {
    if rel.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", rel, path)
    }
}

fn display_path(root: &Path, pkg: &Path) -> String {
    let rel = reader::relative_slash_path(root, pkg);
    if rel.is_empty() {
        pkg.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| pkg.display().to_string())
    } else {
        rel
    }
}
