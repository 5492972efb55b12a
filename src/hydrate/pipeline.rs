//! Per-package pipeline executor: builds the function chain declared in the
//! manifest and pipes the package's stream through it.

use crate::error::Result;
use crate::fnruntime::container;
use crate::fnruntime::runner::{FnRole, FnStatus, FunctionRunner, RunContext};
use crate::hydrate::HydrationContext;
use crate::pkg::manifest::Function;
use crate::pkg::Package;
use crate::resource::ResourceNode;

/// Run the package's declared pipeline: mutators first, then validators.
pub async fn run_pipeline(
    pkg: &Package,
    input: Vec<ResourceNode>,
    ctx: &mut HydrationContext,
) -> Result<Vec<ResourceNode>> {
    let chain: Vec<(FnRole, Function)> = pkg
        .manifest
        .pipeline
        .mutators
        .iter()
        .map(|f| (FnRole::Mutator, f.clone()))
        .chain(
            pkg.manifest
                .pipeline
                .validators
                .iter()
                .map(|f| (FnRole::Validator, f.clone())),
        )
        .collect();
    run_chain(pkg, &chain, input, ctx).await
}

/// Run an explicit function chain (the pipeline, or a named hook).
///
/// All runners are built before anything executes, so permission and
/// configuration failures fire before the first function runs. The
/// container runtime is probed once per hydration, and only when some
/// function actually needs it.
pub(crate) async fn run_chain(
    pkg: &Package,
    chain: &[(FnRole, Function)],
    input: Vec<ResourceNode>,
    ctx: &mut HydrationContext,
) -> Result<Vec<ResourceNode>> {
    let mut runners = Vec::with_capacity(chain.len());
    for (role, func) in chain {
        runners.push(
            FunctionRunner::build(func, *role, &pkg.abs_path, &ctx.opts, &ctx.resolver).await?,
        );
    }

    if !ctx.runtime_checked && runners.iter().any(|r| r.is_container()) {
        container::check_runtime_available().await?;
        ctx.runtime_checked = true;
    }

    let mut stream = input;
    for runner in &runners {
        println!(
            "package \"{}\": [RUNNING] \"{}\"",
            pkg.display_path,
            runner.identity()
        );
        let outcome = {
            let run_ctx = RunContext {
                results: &ctx.results,
                condition: &ctx.condition,
            };
            runner.run(stream, &run_ctx).await
        };
        match outcome {
            Ok((output, status)) => {
                stream = output;
                match status {
                    FnStatus::Pass | FnStatus::Skipped => println!(
                        "package \"{}\": [PASS] \"{}\"",
                        pkg.display_path,
                        runner.identity()
                    ),
                    FnStatus::DeferredFailure => {
                        ctx.deferred_failure = true;
                        println!(
                            "package \"{}\": [FAIL] \"{}\" (deferred)",
                            pkg.display_path,
                            runner.identity()
                        );
                    }
                }
            }
            Err(e) => {
                println!(
                    "package \"{}\": [FAIL] \"{}\"",
                    pkg.display_path,
                    runner.identity()
                );
                return Err(e);
            }
        }
    }
    Ok(stream)
}
