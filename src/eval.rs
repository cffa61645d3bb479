//! The dependency graph evaluator.
//!
//! A [`Session`] walks build expressions lazily, on demand: evaluating a
//! target forces only the minimal slice of the graph needed to decide
//! whether the target is current and, if not, to rebuild it. Dynamic
//! dependencies follow a strict two-phase protocol — first evaluate the
//! inner expression to learn the extra paths, then bring every one of them
//! up to date before the enclosing action may run. Violating that ordering
//! is the classic "missing dependency" build-system bug, so it is the one
//! property this module is structured around.
//!
//! Per-target builds are deduplicated session-wide: the first requester of a
//! rule executes it, concurrent requesters await the same in-flight result,
//! and the recorded outcome (success or failure) is shared with every later
//! consumer. Cycles are detected two ways: an ancestry chain carried down
//! each recursive evaluation catches cycles within one demand chain, and a
//! shared waits-for table catches two concurrent demand chains that would
//! otherwise deadlock awaiting each other's in-flight cells. Memoized
//! sub-computations participate in that table as synthetic nodes, since a
//! memo cell is a join point between chains just like a build cell.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use camino::Utf8PathBuf;
use futures::future::{BoxFuture, join_all};
use indexmap::IndexSet;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::alias::{self, SentinelStore};
use crate::errors::BuildError;
use crate::exec::{DiskState, ExecMode, Executor, FsState, WriteOutcome};
use crate::expr::{BuildExpr, Value};
use crate::graph::{AliasId, BuildGraph, FrozenAlias, Rule};
use crate::memo::MemoCache;
use crate::path::{BuildPath, PathSet};

/// The result of evaluating an expression: its value plus every path it
/// transitively declared or discovered as a dependency.
#[derive(Debug)]
pub struct EvalOutcome {
    /// The expression's result value.
    pub value: Value,
    /// All paths needed by the expression, in evaluation order.
    pub deps: PathSet,
}

/// The chain of targets currently being built on this demand path.
///
/// Cheap to clone and extend; used for precise cycle reporting.
#[derive(Clone, Default)]
struct Ancestry(Arc<Vec<BuildPath>>);

impl Ancestry {
    fn push(&self, target: BuildPath) -> Self {
        let mut chain = self.0.as_ref().clone();
        chain.push(target);
        Self(Arc::new(chain))
    }

    fn last(&self) -> Option<&BuildPath> {
        self.0.last()
    }

    /// If `target` already appears in the chain, return the cycle slice
    /// starting at its first occurrence, closed with `target`.
    fn cycle_with(&self, target: &BuildPath) -> Option<Vec<BuildPath>> {
        let idx = self.0.iter().position(|p| p == target)?;
        let mut cycle: Vec<BuildPath> = self.0.get(idx..).unwrap_or_default().to_vec();
        cycle.push(target.clone());
        Some(cycle)
    }
}

type BuildCell = Arc<OnceCell<Result<(), BuildError>>>;

/// One evaluation session over a frozen graph snapshot.
///
/// Memoization entries, per-target build results, and the waits-for table
/// all live and die with the session.
pub struct Session {
    graph: Arc<BuildGraph>,
    executor: Executor,
    fs: Arc<dyn FsState>,
    memo: MemoCache,
    sentinels: SentinelStore,
    built: Mutex<HashMap<BuildPath, BuildCell>>,
    alias_built: Mutex<HashMap<AliasId, BuildCell>>,
    waits: Mutex<HashMap<BuildPath, IndexSet<BuildPath>>>,
}

impl Session {
    /// Create a session over `graph` rooted at `root`, admitting at most
    /// `jobs` concurrent actions in the given execution mode.
    #[must_use]
    pub fn new(
        graph: Arc<BuildGraph>,
        root: impl Into<Utf8PathBuf>,
        mode: ExecMode,
        jobs: usize,
    ) -> Self {
        let root = root.into();
        Self {
            graph,
            executor: Executor::new(root.clone(), mode, jobs),
            fs: Arc::new(DiskState::new(root.clone())),
            memo: MemoCache::new(),
            sentinels: SentinelStore::new(root),
            built: Mutex::new(HashMap::new()),
            alias_built: Mutex::new(HashMap::new()),
            waits: Mutex::new(HashMap::new()),
        }
    }

    /// The frozen graph this session evaluates.
    #[must_use]
    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    /// Signal fail-fast: let running actions finish, start no new ones.
    pub fn halt(&self) {
        self.executor.halt();
    }

    /// Highest number of actions observed running at once.
    #[must_use]
    pub fn jobs_peak(&self) -> usize {
        self.executor.jobs_peak()
    }

    /// Number of memoization keys forced this session.
    #[must_use]
    pub fn memo_entries(&self) -> usize {
        self.memo.len()
    }

    /// Bring `target` up to date, building it (and its transitive
    /// dependencies) if needed.
    ///
    /// # Errors
    ///
    /// Propagates any [`BuildError`] raised while resolving or building the
    /// target, including cached failures from earlier requesters.
    pub async fn require_path(&self, target: &BuildPath) -> Result<(), BuildError> {
        self.require(target.clone(), Ancestry::default()).await
    }

    /// Bring an alias up to date: force every contribution, then run the
    /// alias action at most once, short-circuited by the definition digest
    /// sentinel.
    ///
    /// # Errors
    ///
    /// Propagates failures from any contribution or from the alias action.
    pub async fn require_alias(&self, alias: &FrozenAlias) -> Result<(), BuildError> {
        let cell = {
            let mut cells = self
                .alias_built
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cells.entry(alias.id.clone()).or_default())
        };
        cell.get_or_init(|| self.build_alias(alias)).await.clone()
    }

    async fn build_alias(&self, alias: &FrozenAlias) -> Result<(), BuildError> {
        let outcome = self
            .eval(alias.deps.clone(), PathSet::default(), Ancestry::default())
            .await?;
        let Some(action) = &alias.action else {
            return Ok(());
        };
        let digest = alias::digest(&alias.id, &outcome.deps, Some(action))?;
        if self.sentinels.is_satisfied(&alias.id, &digest) {
            debug!(alias = %alias.id, "definition unchanged, skipping alias action");
            return Ok(());
        }
        self.executor
            .run_unverified(action, &alias.id.to_string())
            .await?;
        self.sentinels.record(&alias.id, &digest)
    }

    /// Evaluate a free-standing expression with an empty dependency scope.
    ///
    /// # Errors
    ///
    /// Propagates any failure raised while forcing the expression.
    pub async fn evaluate(&self, expr: &BuildExpr) -> Result<EvalOutcome, BuildError> {
        self.eval(expr.clone(), PathSet::default(), Ancestry::default())
            .await
    }

    /// Require a single path: source files must exist, rule targets are
    /// built at most once per session.
    fn require(
        &self,
        target: BuildPath,
        ancestry: Ancestry,
    ) -> BoxFuture<'_, Result<(), BuildError>> {
        Box::pin(async move {
            if let Some(cycle) = ancestry.cycle_with(&target) {
                return Err(BuildError::DependencyCycle { cycle });
            }
            let Some(rule) = self.graph.rule_for(&target) else {
                return if self.fs.exists(&target) {
                    Ok(())
                } else {
                    Err(BuildError::NoRuleToBuildTarget { target })
                };
            };
            let key = rule
                .primary_target()
                .cloned()
                .unwrap_or_else(|| target.clone());
            let cell = {
                let mut cells = self.built.lock().unwrap_or_else(PoisonError::into_inner);
                Arc::clone(cells.entry(key.clone()).or_default())
            };
            if let Some(done) = cell.get() {
                return done.clone();
            }

            // Record the waits-for edge before (possibly) blocking on an
            // in-flight build started by another demand chain.
            let from = ancestry.last().cloned();
            if let Some(from) = &from {
                self.record_wait(from, &key)?;
            }
            let rule = Arc::clone(rule);
            let child_chain = ancestry.push(key.clone());
            let result = cell
                .get_or_init(|| self.build_rule(rule, key.clone(), child_chain))
                .await
                .clone();
            if let Some(from) = &from {
                self.clear_wait(from, &key);
            }
            result
        })
    }

    async fn build_rule(
        &self,
        rule: Arc<Rule>,
        key: BuildPath,
        ancestry: Ancestry,
    ) -> Result<(), BuildError> {
        let outcome = self
            .eval(rule.deps.clone(), PathSet::default(), ancestry)
            .await?;
        if is_stale(self.fs.as_ref(), &rule.targets, &outcome.deps) {
            self.executor
                .run(&rule.action, &rule.targets, key.as_str())
                .await
        } else {
            debug!(target = %key, "up to date");
            Ok(())
        }
    }

    /// Structural recursion over the expression algebra.
    ///
    /// `scope` is the dependency set accumulated earlier in the enclosing
    /// `Seq` chain; a `RunAction` leaf is stale-checked against it.
    fn eval(
        &self,
        expr: BuildExpr,
        scope: PathSet,
        ancestry: Ancestry,
    ) -> BoxFuture<'_, Result<EvalOutcome, BuildError>> {
        Box::pin(async move {
            match expr {
                BuildExpr::Pure(value) => Ok(EvalOutcome {
                    value,
                    deps: PathSet::default(),
                }),
                BuildExpr::Map(inner, f) => {
                    let outcome = self.eval(*inner, scope, ancestry).await?;
                    Ok(EvalOutcome {
                        value: f(outcome.value)?,
                        deps: outcome.deps,
                    })
                }
                BuildExpr::Seq(first, bind) => {
                    let first_outcome = self.eval(*first, scope.clone(), ancestry.clone()).await?;
                    let next = bind(first_outcome.value);
                    let mut inner_scope = scope;
                    inner_scope.extend(first_outcome.deps.iter().cloned());
                    let second_outcome = self.eval(next, inner_scope, ancestry).await?;
                    let mut deps = first_outcome.deps;
                    deps.extend(second_outcome.deps);
                    Ok(EvalOutcome {
                        value: second_outcome.value,
                        deps,
                    })
                }
                BuildExpr::Fanout(left, right) => {
                    let (left_outcome, right_outcome) = tokio::join!(
                        self.eval(*left, scope.clone(), ancestry.clone()),
                        self.eval(*right, scope, ancestry),
                    );
                    let left_outcome = left_outcome?;
                    let right_outcome = right_outcome?;
                    let mut deps = left_outcome.deps;
                    deps.extend(right_outcome.deps);
                    Ok(EvalOutcome {
                        value: Value::Pair(
                            Box::new(left_outcome.value),
                            Box::new(right_outcome.value),
                        ),
                        deps,
                    })
                }
                BuildExpr::NeedPaths(paths) => {
                    self.require_all(&paths, &ancestry).await?;
                    Ok(EvalOutcome {
                        value: Value::Unit,
                        deps: paths,
                    })
                }
                BuildExpr::DynPaths(inner) => {
                    // Phase one: run the discovery step.
                    let outcome = self.eval(*inner, scope, ancestry.clone()).await?;
                    let discovered = outcome.value.into_paths()?;
                    debug!(count = discovered.len(), "discovered dynamic dependencies");
                    // Phase two: every discovered path must be current
                    // before the enclosing consumer proceeds.
                    self.require_all(&discovered, &ancestry).await?;
                    let mut deps = outcome.deps;
                    deps.extend(discovered);
                    Ok(EvalOutcome {
                        value: Value::Unit,
                        deps,
                    })
                }
                BuildExpr::Memoize(key, inner) => {
                    // A memo cell is a join point between demand chains just
                    // like a build cell, so it gets a synthetic node in the
                    // waits-for table; without it, a cycle routed through a
                    // shared key would block on the cell instead of erroring.
                    let marker = BuildPath::from(format!("memo#{key}"));
                    let from = ancestry.last().cloned();
                    if let Some(from) = &from {
                        self.record_wait(from, &marker)?;
                    }
                    let memo_chain = ancestry.push(marker.clone());
                    let result = self
                        .memo
                        .get_or_compute(&key, || async move {
                            self.eval(*inner, PathSet::default(), memo_chain)
                                .await
                                .map(|outcome| (outcome.value, outcome.deps))
                        })
                        .await;
                    if let Some(from) = &from {
                        self.clear_wait(from, &marker);
                    }
                    let (value, deps) = result?;
                    Ok(EvalOutcome { value, deps })
                }
                BuildExpr::RunAction(action, targets) => {
                    let label = targets
                        .first()
                        .map_or_else(|| "anonymous action".to_owned(), ToString::to_string);
                    if is_stale(self.fs.as_ref(), &targets, &scope) {
                        self.executor.run(&action, &targets, &label).await?;
                    } else {
                        debug!(target = %label, "up to date");
                    }
                    Ok(EvalOutcome {
                        value: Value::Paths(targets),
                        deps: PathSet::default(),
                    })
                }
                BuildExpr::WriteIfChanged(path, content) => {
                    let bytes = content()?;
                    let outcome = self.executor.write_if_changed(&path, &bytes)?;
                    Ok(EvalOutcome {
                        value: Value::Bool(outcome == WriteOutcome::Rewritten),
                        deps: PathSet::default(),
                    })
                }
            }
        })
    }

    /// Require every path in the set, concurrently.
    async fn require_all(&self, paths: &PathSet, ancestry: &Ancestry) -> Result<(), BuildError> {
        let pending: Vec<_> = paths
            .iter()
            .map(|path| self.require(path.clone(), ancestry.clone()))
            .collect();
        let mut first_failure = None;
        for result in join_all(pending).await {
            if let Err(err) = result
                && first_failure.is_none()
            {
                first_failure = Some(err);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Record `from` awaiting `to`, detecting a cross-chain cycle first.
    fn record_wait(&self, from: &BuildPath, to: &BuildPath) -> Result<(), BuildError> {
        let mut waits = self.waits.lock().unwrap_or_else(PoisonError::into_inner);
        let mut visited: IndexSet<BuildPath> = IndexSet::new();
        let mut stack: Vec<(BuildPath, Vec<BuildPath>)> = vec![(to.clone(), vec![to.clone()])];
        while let Some((node, trail)) = stack.pop() {
            if &node == from {
                let mut cycle = vec![from.clone()];
                cycle.extend(trail);
                return Err(BuildError::DependencyCycle { cycle });
            }
            if !visited.insert(node.clone()) {
                continue;
            }
            if let Some(nexts) = waits.get(&node) {
                for next in nexts {
                    let mut extended = trail.clone();
                    extended.push(next.clone());
                    stack.push((next.clone(), extended));
                }
            }
        }
        waits.entry(from.clone()).or_default().insert(to.clone());
        Ok(())
    }

    fn clear_wait(&self, from: &BuildPath, to: &BuildPath) {
        let mut waits = self.waits.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(set) = waits.get_mut(from) {
            set.swap_remove(to);
            if set.is_empty() {
                waits.remove(from);
            }
        }
    }
}

/// Decide whether an action must run: any declared target absent, or any
/// resolved dependency newer than the oldest target. An empty target set
/// (a phony action) is always stale.
pub fn is_stale(fs: &dyn FsState, targets: &PathSet, deps: &PathSet) -> bool {
    let mut oldest: Option<SystemTime> = None;
    for target in targets {
        match fs.mtime(target) {
            None => return true,
            Some(mtime) => {
                oldest = Some(oldest.map_or(mtime, |current| current.min(mtime)));
            }
        }
    }
    let Some(oldest) = oldest else {
        return true;
    };
    deps.iter()
        .any(|dep| fs.mtime(dep).is_none_or(|mtime| mtime > oldest))
}
