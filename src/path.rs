//! Path and path-set primitives.
//!
//! Targets, dependencies, and produced artefacts are all identified by
//! [`BuildPath`]: an immutable, cheaply cloneable UTF-8 path with structural
//! equality and ordering. A [`PathSet`] records "the dependencies of X"
//! wherever the engine needs one; it preserves insertion order so that
//! dependency unions collected during sequential evaluation stay
//! deterministic.

use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexSet;
use serde::{Serialize, Serializer};

/// An immutable identifier for a location in the source or output tree.
///
/// Equality, ordering, and hashing are structural (segment based). Paths are
/// never mutated after construction, only compared and combined via
/// [`BuildPath::relative`] and [`BuildPath::reach`].
///
/// # Examples
///
/// ```
/// use kumade::path::BuildPath;
///
/// let out = BuildPath::new("build/obj/main.o");
/// let rel = out.relative(&BuildPath::new("build")).expect("prefix");
/// assert_eq!(rel.as_str(), "obj/main.o");
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuildPath(Arc<Utf8PathBuf>);

impl BuildPath {
    /// Create a path from anything convertible into a UTF-8 path buffer.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self(Arc::new(path.into()))
    }

    /// Borrow the path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Borrow the underlying UTF-8 path.
    #[must_use]
    pub fn as_path(&self) -> &Utf8Path {
        self.0.as_path()
    }

    /// Strip `base` from the front of this path, if it is a prefix.
    #[must_use]
    pub fn relative(&self, base: &Self) -> Option<Self> {
        self.0
            .strip_prefix(base.as_path())
            .ok()
            .map(|stripped| Self::new(stripped.to_path_buf()))
    }

    /// Resolve this path against a base directory.
    ///
    /// Absolute paths are returned unchanged; relative paths are joined onto
    /// `base`.
    #[must_use]
    pub fn reach(&self, base: &Utf8Path) -> Utf8PathBuf {
        if self.0.is_absolute() {
            self.0.as_path().to_path_buf()
        } else {
            base.join(self.0.as_path())
        }
    }
}

impl fmt::Display for BuildPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for BuildPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl From<&str> for BuildPath {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for BuildPath {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<Utf8PathBuf> for BuildPath {
    fn from(value: Utf8PathBuf) -> Self {
        Self(Arc::new(value))
    }
}

impl Serialize for BuildPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A set of [`BuildPath`] with deterministic (insertion) iteration order.
pub type PathSet = IndexSet<BuildPath>;

/// Build a [`PathSet`] from anything yielding path-like values.
///
/// # Examples
///
/// ```
/// use kumade::path::path_set;
///
/// let set = path_set(["a.txt", "b.txt", "a.txt"]);
/// assert_eq!(set.len(), 2);
/// ```
pub fn path_set<I, P>(paths: I) -> PathSet
where
    I: IntoIterator<Item = P>,
    P: Into<BuildPath>,
{
    paths.into_iter().map(Into::into).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("build/a.o", "build", Some("a.o"))]
    #[case("build/sub/a.o", "build", Some("sub/a.o"))]
    #[case("other/a.o", "build", None)]
    fn relative_strips_prefix(
        #[case] path: &str,
        #[case] base: &str,
        #[case] expected: Option<&str>,
    ) {
        let relative = BuildPath::new(path).relative(&BuildPath::new(base));
        assert_eq!(relative.as_ref().map(BuildPath::as_str), expected);
    }

    #[rstest]
    fn reach_joins_relative_paths() {
        let path = BuildPath::new("obj/a.o");
        assert_eq!(path.reach(Utf8Path::new("/work")), "/work/obj/a.o");
    }

    #[rstest]
    fn reach_keeps_absolute_paths() {
        let path = BuildPath::new("/abs/a.o");
        assert_eq!(path.reach(Utf8Path::new("/work")), "/abs/a.o");
    }

    #[rstest]
    fn path_set_deduplicates_and_keeps_order() {
        let set = path_set(["c", "a", "c", "b"]);
        let names: Vec<&str> = set.iter().map(BuildPath::as_str).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }
}
