//! Session-scoped memoization.
//!
//! [`MemoCache`] guarantees at-most-one execution per [`MemoKey`] within one
//! evaluation session. The first caller for a key forces the wrapped
//! computation; concurrent callers for the same key are serialized behind the
//! first evaluation and replay its cached `(value, discovered dependencies)`
//! pair — including a cached failure, which is not retried within the
//! session.
//!
//! Keys are caller-supplied and must be unique per distinct logical
//! computation. Colliding keys for semantically different computations is a
//! caller error the engine cannot detect.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OnceCell;

use crate::errors::BuildError;
use crate::expr::Value;
use crate::path::PathSet;

/// A caller-chosen logical identity for a memoized sub-computation.
///
/// # Examples
///
/// ```
/// use kumade::memo::MemoKey;
///
/// let key = MemoKey::from("module-interface:src/lexer");
/// assert_eq!(key.as_str(), "module-interface:src/lexer");
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MemoKey(Arc<str>);

impl MemoKey {
    /// Borrow the key text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MemoKey {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for MemoKey {
    fn from(value: String) -> Self {
        Self(Arc::from(value.as_str()))
    }
}

impl fmt::Display for MemoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MemoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoKey({})", self.0)
    }
}

/// The cached payload: result value plus the dependencies discovered while
/// computing it.
pub type MemoOutcome = Result<(Value, PathSet), BuildError>;

/// The per-session memoization table.
#[derive(Default)]
pub struct MemoCache {
    cells: Mutex<HashMap<MemoKey, Arc<OnceCell<MemoOutcome>>>>,
}

impl MemoCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached outcome for `key`, computing it with `compute` if
    /// this is the first request.
    ///
    /// Competing first callers block on the winning evaluation instead of
    /// duplicating work.
    ///
    /// # Errors
    ///
    /// Replays the computation's error if it failed (first-hand or cached).
    pub async fn get_or_compute<F, Fut>(&self, key: &MemoKey, compute: F) -> MemoOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MemoOutcome>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(cells.entry(key.clone()).or_default())
        };
        let outcome = cell
            .get_or_init(|| {
                tracing::debug!(key = %key, "memo miss, forcing computation");
                compute()
            })
            .await;
        outcome.clone()
    }

    /// Number of keys seen this session.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no key has been requested yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
