//! Ambient kubectl context save/switch/restore
//!
//! The kubectl context is process-wide state shared with the operator's
//! terminal. A deployment run captures the current context once up front and
//! restores it on every exit path, so whatever happened in between, the
//! operator's tooling ends up pointing where it started.

use tracing::{info, warn};

use crate::error::Error;
use crate::runner::{argv, CommandRunner, RunOpts};
use crate::Result;

/// Saved ambient context for one run.
///
/// The orchestrator calls [`ContextScope::restore`] in both the success and
/// failure arms of a run; restoration itself is best-effort.
#[derive(Debug)]
pub struct ContextScope {
    original: Option<String>,
}

impl ContextScope {
    /// Capture the current kubectl context, if any.
    ///
    /// A missing context (fresh kubeconfig) is not an error; there is simply
    /// nothing to restore later.
    pub fn save(runner: &dyn CommandRunner) -> Result<Self> {
        let out = runner.run(
            &argv(&["kubectl", "config", "current-context"]),
            &RunOpts::probe(),
        )?;
        let original = if out.success && !out.stdout.trim().is_empty() {
            Some(out.stdout.trim().to_string())
        } else {
            None
        };
        Ok(Self { original })
    }

    /// Restore the saved context. Failures are logged and swallowed; a run
    /// that already failed must not be masked by restoration trouble.
    pub fn restore(&self, runner: &dyn CommandRunner) {
        let Some(original) = &self.original else {
            return;
        };
        let result = runner.run(
            &argv(&["kubectl", "config", "use-context", original]),
            &RunOpts::probe(),
        );
        match result {
            Ok(out) if out.success => info!(context = %original, "restored kubectl context"),
            _ => warn!(context = %original, "could not restore kubectl context"),
        }
    }
}

/// Switch the ambient context to the one belonging to `cluster`, and pin its
/// namespace.
///
/// `kubectl config get-contexts` marks the active row with a leading `*`,
/// which shifts the name into the second column; GKE context names embed the
/// cluster name as their final component, hence the suffix match.
pub fn switch_to_cluster(
    runner: &dyn CommandRunner,
    cluster: &str,
    namespace: &str,
) -> Result<()> {
    let out = runner.run(
        &argv(&["kubectl", "config", "get-contexts"]),
        &RunOpts::checked().capture(),
    )?;

    let context = out
        .stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match words.next()? {
                "*" => words.next(),
                name => Some(name),
            }
        })
        .find(|name| name.ends_with(cluster))
        .map(str::to_string)
        .ok_or_else(|| {
            Error::command_failed(
                "kubectl config get-contexts",
                format!("no context found for cluster '{cluster}'"),
            )
        })?;

    runner.run(
        &argv(&["kubectl", "config", "use-context", &context]),
        &RunOpts::checked(),
    )?;
    runner.run(
        &argv(&[
            "kubectl",
            "config",
            "set-context",
            &context,
            "--namespace",
            namespace,
        ]),
        &RunOpts::checked(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::runner::CommandOutput;

    /// Scripted runner: matches on the argv prefix and returns canned output,
    /// recording every invocation.
    struct ScriptedRunner {
        outputs: Vec<(&'static str, CommandOutput)>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<(&'static str, CommandOutput)>) -> Self {
            Self {
                outputs,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, argv: &[String], _opts: &RunOpts) -> crate::Result<CommandOutput> {
            let joined = argv.join(" ");
            self.calls.lock().unwrap().push(joined.clone());
            for (prefix, out) in &self.outputs {
                if joined.starts_with(prefix) {
                    return Ok(out.clone());
                }
            }
            Ok(CommandOutput {
                success: true,
                ..Default::default()
            })
        }
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_save_captures_and_restore_reapplies() {
        let runner = ScriptedRunner::new(vec![(
            "kubectl config current-context",
            ok("gke_demo_us-central1-a_demo\n"),
        )]);
        let scope = ContextScope::save(&runner).unwrap();
        scope.restore(&runner);
        let calls = runner.calls();
        assert!(calls[1].contains("use-context gke_demo_us-central1-a_demo"));
    }

    #[test]
    fn test_restore_is_noop_without_saved_context() {
        let runner = ScriptedRunner::new(vec![(
            "kubectl config current-context",
            CommandOutput {
                success: false,
                ..Default::default()
            },
        )]);
        let scope = ContextScope::save(&runner).unwrap();
        scope.restore(&runner);
        // Only the save probe ran
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn test_switch_finds_context_by_cluster_suffix() {
        let contexts = "CURRENT   NAME                              CLUSTER   AUTHINFO\n\
                        *         gke_proj_us-central1-a_other      c1        u1\n\
                                  gke_proj_us-central1-a_demo       c2        u2\n";
        let runner = ScriptedRunner::new(vec![("kubectl config get-contexts", ok(contexts))]);
        switch_to_cluster(&runner, "demo", "default").unwrap();
        let calls = runner.calls();
        assert!(calls[1].ends_with("use-context gke_proj_us-central1-a_demo"));
        assert!(calls[2].contains("set-context gke_proj_us-central1-a_demo --namespace default"));
    }

    #[test]
    fn test_switch_handles_current_marker_column() {
        let contexts = "CURRENT   NAME                           CLUSTER   AUTHINFO\n\
                        *         gke_proj_us-central1-a_demo    c1        u1\n";
        let runner = ScriptedRunner::new(vec![("kubectl config get-contexts", ok(contexts))]);
        switch_to_cluster(&runner, "demo", "nb").unwrap();
        assert!(runner.calls()[1].ends_with("use-context gke_proj_us-central1-a_demo"));
    }

    #[test]
    fn test_switch_fails_when_no_context_matches() {
        let contexts = "CURRENT   NAME      CLUSTER   AUTHINFO\n\
                        *         minikube  c1        u1\n";
        let runner = ScriptedRunner::new(vec![("kubectl config get-contexts", ok(contexts))]);
        let err = switch_to_cluster(&runner, "demo", "default").unwrap_err();
        assert!(err.to_string().contains("no context found for cluster 'demo'"));
    }
}
