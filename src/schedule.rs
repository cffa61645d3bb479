//! The top-level parallel scheduler.
//!
//! Accepts a collection of independent evaluation requests (targets and
//! aliases), drives them concurrently over one [`Session`], and aggregates
//! every terminal failure into a [`BuildReport`] instead of stopping at the
//! first. The scheduler is best-effort maximal: any rule whose full resolved
//! dependency set is ready becomes eligible immediately, independent of
//! unrelated subtrees; the only global brake is the session's concurrency
//! bound and, in fail-fast mode, the stop flag that prevents new leaf
//! actions from starting while running ones finish naturally.

use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::errors::BuildError;
use crate::eval::Session;
use crate::exec::ExecMode;
use crate::graph::BuildGraph;
use crate::path::BuildPath;

/// A top-level thing to bring up to date.
#[derive(Clone, Debug)]
pub enum Request {
    /// A concrete file target.
    Target(BuildPath),
    /// An alias looked up by name.
    Alias(String),
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Target(path) => write!(f, "{path}"),
            Self::Alias(name) => write!(f, "alias '{name}'"),
        }
    }
}

/// Scheduler configuration.
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Maximum number of concurrently running actions.
    pub jobs: usize,
    /// Action execution mode.
    pub mode: ExecMode,
    /// Stop starting new actions after the first failure.
    pub fail_fast: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism().map_or(1, std::num::NonZero::get),
            mode: ExecMode::default(),
            fail_fast: false,
        }
    }
}

/// One terminal failure, tagged with the request that owned it.
#[derive(Debug)]
pub struct Failure {
    /// The request that failed.
    pub request: String,
    /// The failure itself.
    pub error: BuildError,
}

/// The aggregated result of one scheduler run.
#[derive(Debug, Default)]
pub struct BuildReport {
    /// Requests brought fully up to date.
    pub succeeded: Vec<String>,
    /// Requests that failed, with their errors.
    pub failures: Vec<Failure>,
    /// Requests skipped because fail-fast halted the build first.
    pub halted: Vec<String>,
    /// Highest number of actions observed running at once.
    pub jobs_peak: usize,
}

impl BuildReport {
    /// Whether every request completed without failure.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.halted.is_empty()
    }
}

/// Drive `requests` to completion over a fresh session.
///
/// Independent requests run concurrently; leaf actions respect
/// `options.jobs`. In fail-fast mode, the first failure halts admission of
/// new actions while in-flight processes finish naturally. All collected
/// failures are reported together.
pub async fn run(
    graph: Arc<BuildGraph>,
    root: impl Into<Utf8PathBuf>,
    requests: Vec<Request>,
    options: &BuildOptions,
) -> BuildReport {
    let session = Arc::new(Session::new(
        Arc::clone(&graph),
        root,
        options.mode,
        options.jobs,
    ));
    info!(
        requests = requests.len(),
        jobs = options.jobs,
        fail_fast = options.fail_fast,
        "starting build"
    );

    let fail_fast = options.fail_fast;
    let mut tasks: JoinSet<(String, Result<(), BuildError>)> = JoinSet::new();
    for request in requests {
        let session = Arc::clone(&session);
        let graph = Arc::clone(&graph);
        tasks.spawn(async move {
            let label = request.to_string();
            let result = match request {
                Request::Target(path) => session.require_path(&path).await,
                Request::Alias(name) => match graph.find_alias(&name) {
                    Some(alias) => session.require_alias(alias).await,
                    None => Err(BuildError::NoRuleToBuildTarget {
                        target: BuildPath::from(name),
                    }),
                },
            };
            if result.is_err() && fail_fast {
                session.halt();
            }
            (label, result)
        });
    }

    let mut report = BuildReport::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((label, Ok(()))) => {
                debug!(request = %label, "request satisfied");
                report.succeeded.push(label);
            }
            Ok((label, Err(err))) if err.is_halt() => {
                debug!(request = %label, "request halted before completion");
                report.halted.push(label);
            }
            Ok((label, Err(err))) => {
                error!(request = %label, error = %err, "request failed");
                report.failures.push(Failure {
                    request: label,
                    error: err,
                });
            }
            Err(join_err) => {
                error!(error = %join_err, "evaluation task panicked");
                report.failures.push(Failure {
                    request: "internal".to_owned(),
                    error: BuildError::ActionExecutionFailure {
                        target: "internal".to_owned(),
                        detail: join_err.to_string(),
                    },
                });
            }
        }
    }
    report.jobs_peak = session.jobs_peak();
    info!(
        succeeded = report.succeeded.len(),
        failed = report.failures.len(),
        halted = report.halted.len(),
        jobs_peak = report.jobs_peak,
        "build finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Action;
    use crate::expr::need_paths;
    use crate::graph::{GraphBuilder, TargetSpec};
    use crate::path::{PathSet, path_set};

    fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
        (dir, root)
    }

    fn sleepy_rule(builder: &mut GraphBuilder, name: &str) {
        builder
            .register_rule(
                TargetSpec::Declared(path_set([name])),
                need_paths(PathSet::default()),
                Action::Command {
                    program: "sh".into(),
                    args: vec!["-c".into(), format!("sleep 0.2 && touch {name}")],
                },
            )
            .expect("register");
    }

    #[tokio::test]
    async fn parallel_bound_is_respected() {
        let (_guard, root) = scratch();
        let mut builder = GraphBuilder::new();
        let requests: Vec<Request> = (0..5)
            .map(|i| {
                let name = format!("t{i}");
                sleepy_rule(&mut builder, &name);
                Request::Target(BuildPath::from(name))
            })
            .collect();
        let graph = Arc::new(builder.freeze());
        let options = BuildOptions {
            jobs: 2,
            ..BuildOptions::default()
        };
        let report = run(graph, root, requests, &options).await;
        assert!(report.is_success(), "failures: {:?}", report.failures);
        assert!(
            report.jobs_peak <= 2,
            "bound exceeded: {} actions ran at once",
            report.jobs_peak
        );
    }

    #[tokio::test]
    async fn independent_branches_survive_a_failure() {
        let (_guard, root) = scratch();
        let mut builder = GraphBuilder::new();
        builder
            .register_rule(
                TargetSpec::Declared(path_set(["good"])),
                need_paths(PathSet::default()),
                Action::Command {
                    program: "touch".into(),
                    args: vec!["good".into()],
                },
            )
            .expect("register good");
        builder
            .register_rule(
                TargetSpec::Declared(path_set(["bad"])),
                need_paths(PathSet::default()),
                Action::Command {
                    program: "sh".into(),
                    args: vec!["-c".into(), "exit 1".into()],
                },
            )
            .expect("register bad");
        let graph = Arc::new(builder.freeze());
        let report = run(
            graph,
            root.clone(),
            vec![
                Request::Target("good".into()),
                Request::Target("bad".into()),
            ],
            &BuildOptions::default(),
        )
        .await;
        assert_eq!(report.succeeded, vec!["good".to_owned()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures.first().map(|f| f.request.as_str()), Some("bad"));
        assert!(root.join("good").exists(), "independent output must remain");
    }

    #[tokio::test]
    async fn unknown_alias_is_reported() {
        let (_guard, root) = scratch();
        let graph = Arc::new(GraphBuilder::new().freeze());
        let report = run(
            graph,
            root,
            vec![Request::Alias("missing".into())],
            &BuildOptions::default(),
        )
        .await;
        assert_eq!(report.failures.len(), 1);
    }
}
