//! The function runner: one stream-in/stream-out transform per declared
//! function.
//!
//! Each invocation stamps stable ids on the input, gates on the declared
//! condition, filters by selectors, drives the runtime, enforces the path
//! invariants on the output, re-associates comments by id, absorbs
//! structured results, and merges the untouched out-of-scope resources back
//! into the stream.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::condition::ConditionEvaluator;
use crate::error::{Error, FnFailure, Result};
use crate::fnruntime::{resourcelist, FnRuntime, RuntimeOptions};
use crate::image::TagResolver;
use crate::pkg::manifest::Function;
use crate::pkg::selector;
use crate::resource::{validate_path, ResourceNode};
use crate::results::{FnResult, ResultItem, SharedResults};

/// Whether the function may modify resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnRole {
    Mutator,
    Validator,
}

/// How one invocation ended, for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnStatus {
    Pass,
    Skipped,
    /// The function failed but declared `deferFailure`; its input passed
    /// through unchanged.
    DeferredFailure,
}

/// Shared state one invocation needs from the hydration run.
pub struct RunContext<'a> {
    pub results: &'a SharedResults,
    pub condition: &'a ConditionEvaluator,
}

pub struct FunctionRunner {
    func: Function,
    role: FnRole,
    runtime: FnRuntime,
    fn_config: Option<Mapping>,
    identity: String,
}

impl FunctionRunner {
    /// Resolve the runtime and derive the functionConfig for one declared
    /// function. Permission failures surface here, before anything runs.
    pub async fn build(
        func: &Function,
        role: FnRole,
        pkg_dir: &Path,
        opts: &RuntimeOptions,
        resolver: &TagResolver,
    ) -> Result<FunctionRunner> {
        let runtime = FnRuntime::build(func, opts, resolver).await?;
        let fn_config = derive_fn_config(func, pkg_dir)?;
        Ok(FunctionRunner {
            func: func.clone(),
            role,
            runtime,
            fn_config,
            identity: func.identity(),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn is_container(&self) -> bool {
        self.runtime.is_container()
    }

    /// Run the function over the stream.
    pub async fn run(
        &self,
        mut input: Vec<ResourceNode>,
        ctx: &RunContext<'_>,
    ) -> Result<(Vec<ResourceNode>, FnStatus)> {
        // 1. Stamp a fresh id on every input node and remember the
        // originals for comment re-association and pass-through.
        for (i, node) in input.iter_mut().enumerate() {
            node.id = Some(i as u64);
        }
        let originals: Vec<ResourceNode> = input.clone();

        // 2. Conditional gate, evaluated over the whole current input.
        if let Some(expr) = &self.func.condition {
            match ctx.condition.eval(expr, &input) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(function = %self.identity, "skipped: condition evaluated to false");
                    self.record(
                        ctx,
                        0,
                        String::new(),
                        vec![ResultItem::info("skipped: condition evaluated to false")],
                    );
                    return Ok((clear_ids(input), FnStatus::Skipped));
                }
                Err(e) => {
                    return self.fail(
                        ctx,
                        originals,
                        FnFailure {
                            function: self.identity.clone(),
                            exit_code: -1,
                            stderr: e.to_string(),
                            results: vec![ResultItem::error(e.to_string())],
                        },
                    );
                }
            }
        }

        // 3. Selector filter: only in-scope resources reach the function.
        let mut in_scope = Vec::new();
        let mut out_scope: Vec<(usize, ResourceNode)> = Vec::new();
        let mut first_in_scope = None;
        for (pos, node) in input.into_iter().enumerate() {
            if selector::in_scope(&node, &self.func.selectors, &self.func.exclusions) {
                first_in_scope.get_or_insert(pos);
                in_scope.push(node);
            } else {
                out_scope.push((pos, node));
            }
        }
        let out_scope_ids: HashSet<u64> = out_scope.iter().filter_map(|(_, n)| n.id).collect();
        let in_scope_ids: Vec<u64> = in_scope.iter().filter_map(|n| n.id).collect();

        // 4–6. Invoke the runtime and parse its output.
        let (mut out_items, fn_results, stderr) = match &self.runtime {
            FnRuntime::Builtin(b) => match b.run(in_scope, self.fn_config.as_ref()) {
                Ok((items, results)) => (items, results, String::new()),
                Err(e) => {
                    return self.fail(
                        ctx,
                        originals,
                        FnFailure {
                            function: self.identity.clone(),
                            exit_code: 1,
                            stderr: e.to_string(),
                            results: vec![],
                        },
                    )
                }
            },
            _ => {
                let wire_input = resourcelist::wrap(&in_scope, self.fn_config.as_ref())?;
                let wire = match self.runtime.run_wire(&wire_input, &self.identity).await {
                    Ok(wire) => wire,
                    Err(Error::Function(failure)) => return self.fail(ctx, originals, *failure),
                    Err(other) => return Err(other),
                };
                if wire.exit_code != 0 {
                    // Salvage whatever structured results made it to stdout.
                    let salvaged = resourcelist::unwrap(&wire.stdout, &self.identity)
                        .map(|o| o.results)
                        .unwrap_or_default();
                    return self.fail(
                        ctx,
                        originals,
                        FnFailure {
                            function: self.identity.clone(),
                            exit_code: wire.exit_code,
                            stderr: wire.stderr,
                            results: salvaged,
                        },
                    );
                }
                let out = resourcelist::unwrap(&wire.stdout, &self.identity)?;
                (out.items, out.results, wire.stderr)
            }
        };

        // 7. Invariant enforcement: paths anchored inside the package,
        // (path, index) unique.
        let mut default_indices: HashMap<String, usize> = HashMap::new();
        let mut seen: HashSet<(String, usize)> = HashSet::new();
        for node in &mut out_items {
            if node.path.is_empty() {
                node.path = default_path(node);
                let next = default_indices.entry(node.path.clone()).or_insert(0);
                node.index = *next;
                *next += 1;
            }
            node.path =
                validate_path(&node.path).map_err(|m| Error::protocol(&self.identity, m))?;
            if !seen.insert((node.path.clone(), node.index)) {
                return Err(Error::protocol(
                    &self.identity,
                    format!(
                        "duplicate resources for path {:?} index {}",
                        node.path, node.index
                    ),
                ));
            }
        }

        // 8. Comment re-association by id; unchanged nodes also keep their
        // exact source text. A returned id belonging to an out-of-scope
        // input is an authoring bug and fails loudly.
        let by_id: HashMap<u64, &ResourceNode> =
            originals.iter().filter_map(|n| n.id.map(|id| (id, n))).collect();
        for node in &mut out_items {
            if let Some(id) = node.id.take() {
                if out_scope_ids.contains(&id) {
                    return Err(Error::protocol(
                        &self.identity,
                        format!(
                            "returned resource {} which its selectors exclude",
                            node.display_id()
                        ),
                    ));
                }
                if let Some(orig) = by_id.get(&id) {
                    node.head_comment = orig.head_comment.clone();
                    if node.same_content(orig) {
                        node.carry_source_text(orig);
                    }
                }
            }
        }

        // Validators observe; any difference between input and output is an
        // error, and their (identical) output is discarded in favour of the
        // pristine input.
        if self.role == FnRole::Validator {
            self.check_validator_unchanged(&out_items, &in_scope_ids, &by_id)?;
            out_items = in_scope_ids
                .iter()
                .filter_map(|id| by_id.get(id).map(|n| (*n).clone()))
                .map(|mut n| {
                    n.id = None;
                    n
                })
                .collect();
        }

        // 9. Results absorption.
        self.record(ctx, 0, stderr, fn_results);

        // 10. Merge the out-of-scope resources back at their original
        // stream positions, with the function output where the in-scope
        // block began.
        let mut merged = Vec::with_capacity(out_items.len() + out_scope.len());
        let mut out_items = Some(out_items);
        let total = originals.len();
        let mut out_scope = out_scope.into_iter().peekable();
        for pos in 0..total {
            if Some(pos) == first_in_scope {
                if let Some(items) = out_items.take() {
                    merged.extend(items);
                }
            }
            if matches!(out_scope.peek(), Some((p, _)) if *p == pos) {
                if let Some((_, mut node)) = out_scope.next() {
                    node.id = None;
                    merged.push(node);
                }
            }
        }
        if let Some(items) = out_items.take() {
            merged.extend(items);
        }

        Ok((merged, FnStatus::Pass))
    }

    fn check_validator_unchanged(
        &self,
        out_items: &[ResourceNode],
        in_scope_ids: &[u64],
        by_id: &HashMap<u64, &ResourceNode>,
    ) -> Result<()> {
        if out_items.len() != in_scope_ids.len() {
            return Err(Error::protocol(
                &self.identity,
                format!(
                    "validator changed the resource count ({} in, {} out)",
                    in_scope_ids.len(),
                    out_items.len()
                ),
            ));
        }
        // ids were cleared during re-association; match by content instead,
        // claiming each in-scope original at most once so a dropped input
        // cannot hide behind a duplicated one.
        let mut unclaimed: Vec<&ResourceNode> = in_scope_ids
            .iter()
            .filter_map(|id| by_id.get(id).copied())
            .collect();
        for node in out_items {
            match unclaimed.iter().position(|orig| node.same_content(orig)) {
                Some(i) => {
                    unclaimed.swap_remove(i);
                }
                None => {
                    return Err(Error::protocol(
                        &self.identity,
                        format!("validator modified resource {}", node.display_id()),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Shared failure path: record the result, then either defer (input
    /// passes through unchanged) or abort the pipeline.
    fn fail(
        &self,
        ctx: &RunContext<'_>,
        originals: Vec<ResourceNode>,
        failure: FnFailure,
    ) -> Result<(Vec<ResourceNode>, FnStatus)> {
        self.record(
            ctx,
            failure.exit_code,
            failure.stderr.clone(),
            failure.results.clone(),
        );
        if self.func.defer_failure {
            tracing::warn!(function = %self.identity, exit_code = failure.exit_code,
                "function failed; continuing because deferFailure is set");
            Ok((clear_ids(originals), FnStatus::DeferredFailure))
        } else {
            Err(Error::function(failure))
        }
    }

    fn record(&self, ctx: &RunContext<'_>, exit_code: i32, stderr: String, results: Vec<ResultItem>) {
        ctx.results.lock().unwrap().push(FnResult {
            function: self.identity.clone(),
            exit_code,
            stderr,
            results,
        });
    }
}

fn clear_ids(mut nodes: Vec<ResourceNode>) -> Vec<ResourceNode> {
    for node in &mut nodes {
        node.id = None;
    }
    nodes
}

/// Fallback file for generated resources that carry no path annotation.
fn default_path(node: &ResourceNode) -> String {
    match (node.kind(), node.name()) {
        (Some(kind), Some(name)) => format!("{}_{}.yaml", kind.to_ascii_lowercase(), name),
        _ => "resources.yaml".to_string(),
    }
}

/// Derive the functionConfig resource, from exactly one of the three
/// mutually exclusive forms.
pub fn derive_fn_config(func: &Function, pkg_dir: &Path) -> Result<Option<Mapping>> {
    if let Some(data) = &func.config_map {
        return Ok(Some(synthesize_config_map(data)?));
    }
    if let Some(config) = &func.config {
        return Ok(Some(config.clone()));
    }
    if let Some(rel) = &func.config_path {
        let cleaned = validate_path(rel).map_err(Error::Config)?;
        let path: PathBuf = pkg_dir.join(&cleaned);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("configPath {:?}: {}", rel, e)))?;
        let value: Value = serde_yaml::from_str(&content)
            .map_err(|e| Error::Config(format!("configPath {:?}: {}", rel, e)))?;
        return match value {
            Value::Mapping(m) => Ok(Some(m)),
            _ => Err(Error::Config(format!(
                "configPath {:?} is not a single KRM resource",
                rel
            ))),
        };
    }
    Ok(None)
}

/// `configMap:` shorthand: a synthetic ConfigMap named `function-input`,
/// every value coerced to a string.
fn synthesize_config_map(data: &Mapping) -> Result<Mapping> {
    let mut coerced = Mapping::new();
    for (k, v) in data {
        let value = match v {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(Error::Config(format!(
                    "configMap value for {:?} must be a scalar, got {:?}",
                    k, other
                )))
            }
        };
        coerced.insert(k.clone(), Value::String(value));
    }

    let mut metadata = Mapping::new();
    metadata.insert(
        Value::String("name".to_string()),
        Value::String("function-input".to_string()),
    );
    let mut root = Mapping::new();
    root.insert(
        Value::String("apiVersion".to_string()),
        Value::String("v1".to_string()),
    );
    root.insert(
        Value::String("kind".to_string()),
        Value::String("ConfigMap".to_string()),
    );
    root.insert(Value::String("metadata".to_string()), Value::Mapping(metadata));
    root.insert(Value::String("data".to_string()), Value::Mapping(coerced));
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fnruntime::builtin;
    use crate::pkg::selector::Selector;
    use crate::results;

    fn node(yaml: &str, path: &str, index: usize) -> ResourceNode {
        let mut n = ResourceNode::from_value(serde_yaml::from_str(yaml).unwrap()).unwrap();
        n.path = path.to_string();
        n.index = index;
        n
    }

    fn builtin_runner(
        name: &str,
        role: FnRole,
        func: Function,
        fn_config: Option<Mapping>,
    ) -> FunctionRunner {
        FunctionRunner {
            identity: func.identity(),
            func,
            role,
            runtime: FnRuntime::Builtin(builtin::lookup(name).unwrap()),
            fn_config,
        }
    }

    fn annotate_config() -> Option<Mapping> {
        Some(serde_yaml::from_str("kind: ConfigMap\ndata:\n  ran: \"true\"\n").unwrap())
    }

    fn test_ctx() -> (results::SharedResults, ConditionEvaluator) {
        (results::shared(), ConditionEvaluator::new())
    }

    #[tokio::test]
    async fn test_condition_false_skips_and_records() {
        let func = Function {
            image: Some("krm-fn/set-annotations".to_string()),
            condition: Some(r#"resources.exists(r, r.kind == "StatefulSet")"#.to_string()),
            ..Default::default()
        };
        let runner = builtin_runner("set-annotations", FnRole::Mutator, func, annotate_config());
        let (shared, condition) = test_ctx();
        let ctx = RunContext {
            results: &shared,
            condition: &condition,
        };

        let input = vec![node("kind: Service\nmetadata:\n  name: s\n", "svc.yaml", 0)];
        let (output, status) = runner.run(input, &ctx).await.unwrap();

        assert_eq!(status, FnStatus::Skipped);
        assert_eq!(output[0].annotation("ran"), None);
        let recorded = shared.lock().unwrap();
        assert_eq!(recorded.items.len(), 1);
        assert!(recorded.items[0].results[0].message.contains("skipped"));
    }

    #[tokio::test]
    async fn test_condition_true_runs_function() {
        let func = Function {
            image: Some("krm-fn/set-annotations".to_string()),
            condition: Some(
                r#"resources.exists(r, r.kind == "ConfigMap" && r.metadata.name == "app-config")"#
                    .to_string(),
            ),
            ..Default::default()
        };
        let runner = builtin_runner("set-annotations", FnRole::Mutator, func, annotate_config());
        let (shared, condition) = test_ctx();
        let ctx = RunContext {
            results: &shared,
            condition: &condition,
        };

        let input = vec![node(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app-config\n",
            "cm.yaml",
            0,
        )];
        let (output, status) = runner.run(input, &ctx).await.unwrap();

        assert_eq!(status, FnStatus::Pass);
        assert_eq!(output[0].annotation("ran"), Some("true"));
    }

    #[tokio::test]
    async fn test_selectors_scope_and_merge_back() {
        let func = Function {
            image: Some("krm-fn/set-annotations".to_string()),
            selectors: vec![Selector {
                kind: Some("ConfigMap".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let runner = builtin_runner("set-annotations", FnRole::Mutator, func, annotate_config());
        let (shared, condition) = test_ctx();
        let ctx = RunContext {
            results: &shared,
            condition: &condition,
        };

        let input = vec![
            node("kind: Service\nmetadata:\n  name: front\n", "svc.yaml", 0),
            node("kind: ConfigMap\nmetadata:\n  name: cfg\n", "cm.yaml", 0),
            node("kind: Service\nmetadata:\n  name: back\n", "svc.yaml", 1),
        ];
        let (output, _) = runner.run(input, &ctx).await.unwrap();

        assert_eq!(output.len(), 3);
        // Out-of-scope services keep their stream positions and are
        // untouched; the in-scope block sits where it started.
        assert_eq!(output[0].name(), Some("front"));
        assert_eq!(output[0].annotation("ran"), None);
        assert_eq!(output[1].name(), Some("cfg"));
        assert_eq!(output[1].annotation("ran"), Some("true"));
        assert_eq!(output[2].name(), Some("back"));
        assert_eq!(output[2].annotation("ran"), None);
        assert!(output.iter().all(|n| n.id.is_none()));
    }

    #[tokio::test]
    async fn test_comment_reassociation_on_changed_node() {
        let func = Function {
            image: Some("krm-fn/set-annotations".to_string()),
            ..Default::default()
        };
        let runner = builtin_runner("set-annotations", FnRole::Mutator, func, annotate_config());
        let (shared, condition) = test_ctx();
        let ctx = RunContext {
            results: &shared,
            condition: &condition,
        };

        let mut input = node("kind: Deployment\nmetadata:\n  name: web\n", "d.yaml", 0);
        input.head_comment = "# owner: team-a\n".to_string();
        let (output, _) = runner.run(vec![input], &ctx).await.unwrap();

        assert_eq!(output[0].head_comment, "# owner: team-a\n");
        assert_eq!(output[0].annotation("ran"), Some("true"));
        // Content changed, so the exact source text is gone.
        assert!(output[0].source_text().is_none());
    }

    #[tokio::test]
    async fn test_validator_mutation_is_error() {
        let func = Function {
            image: Some("krm-fn/set-labels".to_string()),
            ..Default::default()
        };
        let cfg: Mapping = serde_yaml::from_str("kind: ConfigMap\ndata:\n  tier: db\n").unwrap();
        let runner = builtin_runner("set-labels", FnRole::Validator, func, Some(cfg));
        let (shared, condition) = test_ctx();
        let ctx = RunContext {
            results: &shared,
            condition: &condition,
        };

        let input = vec![node("kind: Service\nmetadata:\n  name: s\n", "svc.yaml", 0)];
        let err = runner.run(input, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("validator"));
    }

    #[test]
    fn test_validator_drop_and_duplicate_detected() {
        let func = Function {
            image: Some("krm-fn/set-labels".to_string()),
            ..Default::default()
        };
        let runner = builtin_runner("set-labels", FnRole::Validator, func, None);

        let mut a = node("kind: ConfigMap\nmetadata:\n  name: a\n", "a.yaml", 0);
        a.id = Some(0);
        let mut b = node("kind: Service\nmetadata:\n  name: b\n", "b.yaml", 0);
        b.id = Some(1);
        let by_id: HashMap<u64, &ResourceNode> = HashMap::from([(0u64, &a), (1u64, &b)]);
        let ids: Vec<u64> = vec![0, 1];

        // The same resources, reordered, are still an observation.
        let ok = vec![b.clone(), a.clone()];
        assert!(runner.check_validator_unchanged(&ok, &ids, &by_id).is_ok());

        // Dropping one input and duplicating another keeps the count and
        // matches content existentially, but is a mutation all the same.
        let dup = vec![b.clone(), b.clone()];
        let err = runner
            .check_validator_unchanged(&dup, &ids, &by_id)
            .unwrap_err();
        assert!(err.to_string().contains("validator"));
    }

    #[test]
    fn test_synthesize_config_map_coerces_scalars() {
        let data: Mapping = serde_yaml::from_str("foo: bar\nn: \"3\"\ncount: 7\nflag: true\n").unwrap();
        let cm = synthesize_config_map(&data).unwrap();
        let rendered = serde_yaml::to_string(&cm).unwrap();
        assert!(rendered.contains("kind: ConfigMap"));
        assert!(rendered.contains("name: function-input"));
        assert!(rendered.contains("foo: bar"));
        assert!(rendered.contains("n: '3'") || rendered.contains("n: \"3\""));
        assert!(rendered.contains("count: '7'") || rendered.contains("count: \"7\""));
        assert!(rendered.contains("flag: 'true'") || rendered.contains("flag: \"true\""));
    }

    #[test]
    fn test_derive_fn_config_from_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("fn-config.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\ndata:\n  a: b\n",
        )
        .unwrap();
        let func = Function {
            image: Some("example.com/fn:v1.0.0".to_string()),
            config_path: Some("fn-config.yaml".to_string()),
            ..Default::default()
        };
        let config = derive_fn_config(&func, dir.path()).unwrap().unwrap();
        assert_eq!(crate::resource::get_str(&config, "kind"), Some("ConfigMap"));
    }

    #[test]
    fn test_default_path_for_generated_resources() {
        let n = node("kind: Service\nmetadata:\n  name: web\n", "", 0);
        assert_eq!(default_path(&n), "service_web.yaml");
    }
}
