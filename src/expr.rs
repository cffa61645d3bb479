//! The build expression algebra.
//!
//! A [`BuildExpr`] is a composable value describing "a computation that
//! consumes some statically declared paths, optionally discovers more paths
//! from intermediate results, and produces a [`Value`]". Rule producers build
//! these; the evaluator walks them lazily with one structurally recursive
//! function. The algebra is closed under the combinators defined here —
//! there is no trait object or inheritance in the graph, just one sum type.
//!
//! # Examples
//!
//! ```
//! use kumade::expr::{dyn_paths, need_paths, seq, BuildExpr, Value};
//! use kumade::path::path_set;
//!
//! // Depend on a depfile, then on whatever paths it names.
//! let deps: BuildExpr = seq(need_paths(path_set(["main.d"])), |_| {
//!     dyn_paths(kumade::expr::pure(Value::Paths(path_set(["main.c", "main.h"]))))
//! });
//! ```

use std::fmt;
use std::sync::Arc;

use crate::errors::BuildError;
use crate::exec::Action;
use crate::memo::MemoKey;
use crate::path::{BuildPath, PathSet};

/// The dynamic result type flowing through build expressions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// No interesting result.
    Unit,
    /// A boolean, e.g. "did `write_if_changed` rewrite the file".
    Bool(bool),
    /// Free-form text, e.g. a parsed tool report.
    Text(String),
    /// Raw bytes, e.g. file contents.
    Bytes(Vec<u8>),
    /// A set of paths, e.g. a discovered dependency set.
    Paths(PathSet),
    /// The pairing produced by [`fanout`].
    Pair(Box<Value>, Box<Value>),
}

impl Value {
    /// The shape name used in [`BuildError::ValueShape`] diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Bool(_) => "bool",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Paths(_) => "paths",
            Self::Pair(_, _) => "pair",
        }
    }

    /// Extract a path set, failing with a shape diagnostic otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::ValueShape`] when the value is not `Paths`.
    pub fn into_paths(self) -> Result<PathSet, BuildError> {
        match self {
            Self::Paths(set) => Ok(set),
            other => Err(BuildError::ValueShape {
                expected: "paths",
                found: other.kind(),
            }),
        }
    }
}

/// A pure transformation applied by [`map`].
pub type MapFn = Arc<dyn Fn(Value) -> Result<Value, BuildError> + Send + Sync>;

/// A continuation fed the first component's result by [`seq`].
pub type BindFn = Arc<dyn Fn(Value) -> BuildExpr + Send + Sync>;

/// A content producer for [`write_if_changed`].
pub type ContentFn = Arc<dyn Fn() -> Result<Vec<u8>, BuildError> + Send + Sync>;

/// A composable description of a build computation.
///
/// The statically written expression graph need not be acyclic — dynamic
/// dependencies are discovered, not declared up front — but the dependency
/// relation resolved at evaluation time must be, and the evaluator treats a
/// resolved cycle as fatal.
#[derive(Clone)]
pub enum BuildExpr {
    /// A fixed value with no dependencies.
    Pure(Value),
    /// Transform the inner result with a pure function; adds no dependencies.
    Map(Box<BuildExpr>, MapFn),
    /// Run the first expression, then feed its result to the continuation.
    /// Dependencies are the union, collected in evaluation order, and the
    /// first component's side effects are observable before the continuation
    /// is forced.
    Seq(Box<BuildExpr>, BindFn),
    /// Evaluate two independent expressions and pair their results. The
    /// primary vehicle for parallel sub-builds: siblings may run
    /// concurrently.
    Fanout(Box<BuildExpr>, Box<BuildExpr>),
    /// Declare a static dependency on a known path set; yields `Unit`.
    NeedPaths(PathSet),
    /// Evaluate the inner expression to obtain an *additional* path set
    /// discovered at run time, and fold it into the enclosing dependency set
    /// before any consuming action runs.
    DynPaths(Box<BuildExpr>),
    /// Session-scoped at-most-once evaluation of the inner expression.
    Memoize(MemoKey, Box<BuildExpr>),
    /// Once every dependency in scope is satisfied, run the action if its
    /// declared targets are stale; yields the produced path set.
    RunAction(Action, PathSet),
    /// Compute content, compare byte-for-byte with the file at the path, and
    /// overwrite only on difference; yields `Bool(rewritten)`.
    WriteIfChanged(BuildPath, ContentFn),
}

impl fmt::Debug for BuildExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pure(value) => f.debug_tuple("Pure").field(value).finish(),
            Self::Map(inner, _) => f.debug_tuple("Map").field(inner).finish(),
            Self::Seq(first, _) => f.debug_tuple("Seq").field(first).finish(),
            Self::Fanout(left, right) => {
                f.debug_tuple("Fanout").field(left).field(right).finish()
            }
            Self::NeedPaths(set) => f.debug_tuple("NeedPaths").field(set).finish(),
            Self::DynPaths(inner) => f.debug_tuple("DynPaths").field(inner).finish(),
            Self::Memoize(key, inner) => {
                f.debug_tuple("Memoize").field(key).field(inner).finish()
            }
            Self::RunAction(action, targets) => f
                .debug_tuple("RunAction")
                .field(action)
                .field(targets)
                .finish(),
            Self::WriteIfChanged(path, _) => {
                f.debug_tuple("WriteIfChanged").field(path).finish()
            }
        }
    }
}

/// Produce a fixed value with no dependencies.
#[must_use]
pub fn pure(value: Value) -> BuildExpr {
    BuildExpr::Pure(value)
}

/// Transform the result of `inner` with a pure function.
pub fn map<F>(inner: BuildExpr, f: F) -> BuildExpr
where
    F: Fn(Value) -> Result<Value, BuildError> + Send + Sync + 'static,
{
    BuildExpr::Map(Box::new(inner), Arc::new(f))
}

/// Run `first`, then feed its result into the expression built by `bind`.
pub fn seq<F>(first: BuildExpr, bind: F) -> BuildExpr
where
    F: Fn(Value) -> BuildExpr + Send + Sync + 'static,
{
    BuildExpr::Seq(Box::new(first), Arc::new(bind))
}

/// Run `first`, discard its value, then run `second`.
#[must_use]
pub fn then(first: BuildExpr, second: BuildExpr) -> BuildExpr {
    seq(first, move |_| second.clone())
}

/// Evaluate two independent expressions, pairing their results.
#[must_use]
pub fn fanout(left: BuildExpr, right: BuildExpr) -> BuildExpr {
    BuildExpr::Fanout(Box::new(left), Box::new(right))
}

/// Declare a static dependency on a known path set.
#[must_use]
pub fn need_paths(paths: PathSet) -> BuildExpr {
    BuildExpr::NeedPaths(paths)
}

/// Fold a run-time-discovered path set into the enclosing dependency set.
#[must_use]
pub fn dyn_paths(inner: BuildExpr) -> BuildExpr {
    BuildExpr::DynPaths(Box::new(inner))
}

/// Cache the inner expression under `key` for the evaluation session.
pub fn memoize(key: impl Into<MemoKey>, inner: BuildExpr) -> BuildExpr {
    BuildExpr::Memoize(key.into(), Box::new(inner))
}

/// Execute `action` once the surrounding dependency scope is satisfied,
/// declaring exactly `targets` as its outputs.
#[must_use]
pub fn run_action(action: Action, targets: PathSet) -> BuildExpr {
    BuildExpr::RunAction(action, targets)
}

/// Compute content and overwrite `path` only when the bytes differ.
pub fn write_if_changed<F>(path: impl Into<BuildPath>, content: F) -> BuildExpr
where
    F: Fn() -> Result<Vec<u8>, BuildError> + Send + Sync + 'static,
{
    BuildExpr::WriteIfChanged(path.into(), Arc::new(content))
}
