//! Alias definition digests and sentinel files.
//!
//! An alias is invalidated by *definition changes*, not by file-content
//! staleness of its dependencies (the evaluator already enforces staleness
//! transitively by forcing each dependency). The digest is a SHA-256 over
//! the canonical JSON of the alias identity, its sorted resolved dependency
//! list, and its serialized action. It is persisted as a hidden sentinel
//! file whose path encodes the alias identity and digest; the file's mere
//! existence — not its content — marks the alias action as already run for
//! this definition.

use camino::Utf8PathBuf;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::errors::BuildError;
use crate::exec::Action;
use crate::graph::AliasId;
use crate::path::PathSet;

/// A stable content hash of an alias definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AliasDigest(String);

impl AliasDigest {
    /// The full hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The digest prefix embedded in sentinel file names.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..16).unwrap_or(&self.0)
    }
}

/// The canonicalized record the digest is computed over.
#[derive(Serialize)]
struct DigestRecord<'a> {
    name: &'a str,
    dir: &'a str,
    deps: Vec<&'a str>,
    action: Option<&'a Action>,
}

/// Compute the definition digest for an alias with `resolved_deps`.
///
/// # Errors
///
/// Returns an I/O diagnostic when the definition cannot be serialized.
pub fn digest(
    id: &AliasId,
    resolved_deps: &PathSet,
    action: Option<&Action>,
) -> Result<AliasDigest, BuildError> {
    let mut deps: Vec<&str> = resolved_deps.iter().map(|p| p.as_str()).collect();
    deps.sort_unstable();
    let record = DigestRecord {
        name: &id.name,
        dir: id.dir.as_str(),
        deps,
        action,
    };
    let canonical = serde_json_canonicalizer::to_vec(&record).map_err(|err| BuildError::Io {
        context: format!("serialize alias definition {id}"),
        detail: err.to_string(),
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(AliasDigest(format!("{:x}", hasher.finalize())))
}

/// Reads and writes alias digest sentinels under the build root.
pub struct SentinelStore {
    root: Utf8PathBuf,
}

impl SentinelStore {
    /// Create a store resolving alias directories against `root`.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The deterministic sentinel path for `(id, digest)`.
    #[must_use]
    pub fn sentinel_path(&self, id: &AliasId, digest: &AliasDigest) -> Utf8PathBuf {
        id.dir
            .reach(&self.root)
            .join(format!(".kumade-alias-{}-{}", id.name, digest.short()))
    }

    /// Whether the alias action already ran for this exact definition.
    #[must_use]
    pub fn is_satisfied(&self, id: &AliasId, digest: &AliasDigest) -> bool {
        self.sentinel_path(id, digest).exists()
    }

    /// Record that the alias action ran for this definition, dropping
    /// sentinels left over from previous definitions of the same alias.
    ///
    /// # Errors
    ///
    /// Returns an I/O diagnostic when the sentinel cannot be written.
    pub fn record(&self, id: &AliasId, digest: &AliasDigest) -> Result<(), BuildError> {
        let dir = id.dir.reach(&self.root);
        std::fs::create_dir_all(&dir)
            .map_err(|err| BuildError::io(format!("create alias directory {dir}"), &err))?;

        let pattern = dir.join(format!(".kumade-alias-{}-*", id.name));
        if let Ok(stale) = glob::glob(pattern.as_str()) {
            for entry in stale.flatten() {
                debug!(path = %entry.display(), alias = %id, "removing stale alias sentinel");
                let _ = std::fs::remove_file(entry);
            }
        }

        let path = self.sentinel_path(id, digest);
        std::fs::write(&path, digest.as_str())
            .map_err(|err| BuildError::io(format!("write alias sentinel {path}"), &err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::path_set;

    fn alias_id(name: &str) -> AliasId {
        AliasId {
            name: name.to_owned(),
            dir: "pkg".into(),
        }
    }

    fn sample_action() -> Action {
        Action::Command {
            program: "true".into(),
            args: vec![],
        }
    }

    #[test]
    fn digest_ignores_dependency_registration_order() {
        let id = alias_id("test");
        let forward = digest(&id, &path_set(["a", "b", "c"]), None).expect("digest");
        let reversed = digest(&id, &path_set(["c", "b", "a"]), None).expect("digest");
        assert_eq!(forward, reversed);
    }

    #[test]
    fn digest_changes_with_definition() {
        let id = alias_id("test");
        let base = digest(&id, &path_set(["a"]), None).expect("digest");
        let more_deps = digest(&id, &path_set(["a", "b"]), None).expect("digest");
        let with_action = digest(&id, &path_set(["a"]), Some(&sample_action())).expect("digest");
        assert_ne!(base, more_deps);
        assert_ne!(base, with_action);
    }

    #[test]
    fn record_replaces_stale_sentinels() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8 tempdir");
        let store = SentinelStore::new(root);
        let id = alias_id("install");

        let old = digest(&id, &path_set(["a"]), None).expect("digest");
        store.record(&id, &old).expect("record old");
        assert!(store.is_satisfied(&id, &old));

        let new = digest(&id, &path_set(["a", "b"]), None).expect("digest");
        assert!(!store.is_satisfied(&id, &new));
        store.record(&id, &new).expect("record new");

        assert!(store.is_satisfied(&id, &new));
        assert!(!store.is_satisfied(&id, &old), "stale sentinel must be gone");
    }
}
