//! End-to-end tests for the protocol invariants enforced on function
//! output, driven through real `exec` functions (shell scripts) so the
//! full wire round trip is exercised.

use std::path::Path;

use krm_render::fnruntime::RuntimeOptions;
use krm_render::hydrate::{self, HydrationOptions};
use krm_render::results;
use krm_render::Error;

fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

/// A package whose single mutator (or validator) is `sh <script>`.
fn make_package(dir: &Path, script: &Path, role: &str, defer: bool, files: &[(&str, &str)]) {
    let kptfile = format!(
        "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: app\npipeline:\n  {}:\n    - exec: sh {}\n      deferFailure: {}\n",
        role,
        script.display(),
        defer
    );
    write(&dir.join("Kptfile"), &kptfile);
    for (rel, content) in files {
        write(&dir.join(rel), content);
    }
}

fn allow_exec() -> HydrationOptions {
    HydrationOptions {
        runtime: RuntimeOptions {
            allow_exec: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn render(dir: &Path, opts: HydrationOptions) -> krm_render::Result<hydrate::RenderOutcome> {
    hydrate::render(dir, opts, results::shared()).await
}

const INPUT_CM: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n";

/// Emits two resources with the same (path, index) pair.
const DUPLICATE_SCRIPT: &str = r#"cat > /dev/null
cat <<'EOF'
apiVersion: config.kubernetes.io/v1
kind: ResourceList
items:
  - apiVersion: v1
    kind: ConfigMap
    metadata:
      name: a
      annotations:
        config.kubernetes.io/path: x/y.yaml
        config.kubernetes.io/index: "0"
  - apiVersion: v1
    kind: ConfigMap
    metadata:
      name: b
      annotations:
        config.kubernetes.io/path: x/y.yaml
        config.kubernetes.io/index: "0"
EOF
"#;

#[tokio::test]
async fn test_duplicate_path_index_is_fatal() {
    let scripts = tempfile::tempdir().unwrap();
    let script = scripts.path().join("dup.sh");
    write(&script, DUPLICATE_SCRIPT);

    let dir = tempfile::tempdir().unwrap();
    make_package(dir.path(), &script, "mutators", false, &[("cm.yaml", INPUT_CM)]);

    let err = render(dir.path(), allow_exec()).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("duplicate"), "got: {}", message);
    assert!(message.contains("x/y.yaml"), "got: {}", message);
    assert!(message.contains("0"), "got: {}", message);
}

/// Emits a resource whose cleaned path escapes the package.
const ESCAPE_SCRIPT: &str = r#"cat > /dev/null
cat <<'EOF'
apiVersion: config.kubernetes.io/v1
kind: ResourceList
items:
  - apiVersion: v1
    kind: ConfigMap
    metadata:
      name: a
      annotations:
        config.kubernetes.io/path: ../../escape.yaml
        config.kubernetes.io/index: "0"
EOF
"#;

#[tokio::test]
async fn test_path_escape_is_fatal() {
    let scripts = tempfile::tempdir().unwrap();
    let script = scripts.path().join("escape.sh");
    write(&script, ESCAPE_SCRIPT);

    let dir = tempfile::tempdir().unwrap();
    make_package(dir.path(), &script, "mutators", false, &[("cm.yaml", INPUT_CM)]);

    let err = render(dir.path(), allow_exec()).await.unwrap_err();
    assert!(err.to_string().contains("escapes"), "got: {}", err);
    assert!(!dir.path().parent().unwrap().join("escape.yaml").exists());
}

const FAILING_SCRIPT: &str = r#"cat > /dev/null
echo "something broke" >&2
echo "and a second line" >&2
exit 2
"#;

#[tokio::test]
async fn test_nonzero_exit_reports_code_and_stderr() {
    let scripts = tempfile::tempdir().unwrap();
    let script = scripts.path().join("fail.sh");
    write(&script, FAILING_SCRIPT);

    let dir = tempfile::tempdir().unwrap();
    make_package(dir.path(), &script, "mutators", false, &[("cm.yaml", INPUT_CM)]);

    let err = render(dir.path(), allow_exec()).await.unwrap_err();
    match err {
        Error::Function(failure) => {
            assert_eq!(failure.exit_code, 2);
            assert!(failure.stderr.contains("something broke"));
            assert!(failure.stderr.contains("and a second line"));
        }
        other => panic!("expected a function failure, got: {}", other),
    }
}

#[tokio::test]
async fn test_defer_failure_continues_with_input_unchanged() {
    let scripts = tempfile::tempdir().unwrap();
    let script = scripts.path().join("fail.sh");
    write(&script, FAILING_SCRIPT);

    let dir = tempfile::tempdir().unwrap();
    make_package(dir.path(), &script, "mutators", true, &[("cm.yaml", INPUT_CM)]);

    let outcome = render(dir.path(), allow_exec()).await.unwrap();
    assert!(outcome.deferred_failure, "the run must still report failure");

    let after = std::fs::read_to_string(dir.path().join("cm.yaml")).unwrap();
    assert_eq!(after, INPUT_CM);
}

/// A validator that returns a modified resource instead of observing.
const MUTATING_VALIDATOR_SCRIPT: &str = r#"cat > /dev/null
cat <<'EOF'
apiVersion: config.kubernetes.io/v1
kind: ResourceList
items:
  - apiVersion: v1
    kind: ConfigMap
    metadata:
      name: changed
      annotations:
        config.kubernetes.io/path: cm.yaml
        config.kubernetes.io/index: "0"
EOF
"#;

#[tokio::test]
async fn test_validator_mutation_is_fatal() {
    let scripts = tempfile::tempdir().unwrap();
    let script = scripts.path().join("mutate.sh");
    write(&script, MUTATING_VALIDATOR_SCRIPT);

    let dir = tempfile::tempdir().unwrap();
    make_package(dir.path(), &script, "validators", false, &[("cm.yaml", INPUT_CM)]);

    let err = render(dir.path(), allow_exec()).await.unwrap_err();
    assert!(err.to_string().contains("validator"), "got: {}", err);
}

/// Renames the kind while echoing back the id annotation, so comment
/// re-association has something to work with.
const RENAME_KIND_SCRIPT: &str = r#"cat > /dev/null
cat <<'EOF'
apiVersion: config.kubernetes.io/v1
kind: ResourceList
items:
  - apiVersion: apps/v1
    kind: StatefulSet
    metadata:
      name: web
      annotations:
        config.kubernetes.io/path: deploy.yaml
        config.kubernetes.io/index: "0"
        config.kubernetes.io/id: "0"
EOF
"#;

#[tokio::test]
async fn test_comment_preserved_across_kind_rename() {
    let scripts = tempfile::tempdir().unwrap();
    let script = scripts.path().join("rename.sh");
    write(&script, RENAME_KIND_SCRIPT);

    let dir = tempfile::tempdir().unwrap();
    make_package(
        dir.path(),
        &script,
        "mutators",
        false,
        &[(
            "deploy.yaml",
            "# owner: team-a\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n",
        )],
    );

    let outcome = render(dir.path(), allow_exec()).await.unwrap();
    assert!(!outcome.deferred_failure);

    let after = std::fs::read_to_string(dir.path().join("deploy.yaml")).unwrap();
    assert!(after.starts_with("# owner: team-a\n"), "got: {}", after);
    assert!(after.contains("kind: StatefulSet"));
    assert!(!after.contains("config.kubernetes.io/id"));
}

/// The function deletes the only resource of a file; the file goes away.
const DELETE_ALL_SCRIPT: &str = r#"cat > /dev/null
cat <<'EOF'
apiVersion: config.kubernetes.io/v1
kind: ResourceList
items: []
EOF
"#;

#[tokio::test]
async fn test_emptied_files_are_removed() {
    let scripts = tempfile::tempdir().unwrap();
    let script = scripts.path().join("delete.sh");
    write(&script, DELETE_ALL_SCRIPT);

    let dir = tempfile::tempdir().unwrap();
    make_package(dir.path(), &script, "mutators", false, &[("cm.yaml", INPUT_CM)]);

    render(dir.path(), allow_exec()).await.unwrap();
    assert!(!dir.path().join("cm.yaml").exists());
}
