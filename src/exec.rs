//! Action execution.
//!
//! An [`Action`] is the concrete work a rule performs once its dependencies
//! are satisfied: spawn an external process or perform a built-in file
//! operation. The [`Executor`] runs actions under a concurrency bound,
//! verifies that declared outputs were actually produced, and provides the
//! atomic write-if-different primitive that breaks unnecessary invalidation
//! cascades.
//!
//! Two modes exist. `Direct` shares the working directory with concurrently
//! running actions and can only verify that declared outputs exist
//! afterwards. `Sandboxed` stages outputs in a private scratch directory, so
//! the produced file set is observed exactly — extra files are as fatal as
//! missing ones — before the outputs are moved into place.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::errors::BuildError;
use crate::path::{BuildPath, PathSet};

/// Environment variable naming the real build root inside sandboxed actions.
pub const ROOT_ENV: &str = "KUMADE_ROOT";

/// A primitive operation a rule can perform, with the exact output paths it
/// is expected to produce carried by the enclosing rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Spawn an external process.
    Command {
        /// Program to execute.
        program: String,
        /// Arguments, passed verbatim.
        args: Vec<String>,
    },
    /// Spawn an external process and capture its stdout into a file.
    CommandToFile {
        /// Program to execute.
        program: String,
        /// Arguments, passed verbatim.
        args: Vec<String>,
        /// Where captured stdout is written.
        stdout: BuildPath,
    },
    /// Copy one file to another location.
    Copy {
        /// Source path, resolved against the build root.
        src: BuildPath,
        /// Destination path.
        dest: BuildPath,
    },
    /// Create a symbolic link.
    Symlink {
        /// The path the link points at.
        original: BuildPath,
        /// The link to create.
        link: BuildPath,
    },
}

impl Action {
    /// Outputs that can be inferred from the action itself, for rules
    /// registered without declared targets.
    #[must_use]
    pub fn inferred_outputs(&self) -> PathSet {
        match self {
            Self::Command { .. } => PathSet::default(),
            Self::CommandToFile { stdout, .. } => PathSet::from_iter([stdout.clone()]),
            Self::Copy { dest, .. } => PathSet::from_iter([dest.clone()]),
            Self::Symlink { link, .. } => PathSet::from_iter([link.clone()]),
        }
    }
}

/// How actions share (or do not share) the working directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecMode {
    /// Run in the shared build root.
    #[default]
    Direct,
    /// Stage outputs in a private scratch directory, verify exactly, then
    /// move into place. Required when the toolchain cannot be told to write
    /// outputs to a private location.
    Sandboxed,
}

/// Outcome of [`Executor::write_if_changed`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Existing bytes matched; the file was not touched.
    Unchanged,
    /// The file was (re)written atomically.
    Rewritten,
}

/// Oracle for the current file-system state consulted by staleness checks.
///
/// Kept behind a trait so evaluator decisions can be probed deterministically
/// in tests.
pub trait FsState: Send + Sync {
    /// Modification time of `path`, or `None` when absent.
    fn mtime(&self, path: &BuildPath) -> Option<SystemTime>;

    /// Whether `path` currently exists.
    fn exists(&self, path: &BuildPath) -> bool {
        self.mtime(path).is_some()
    }
}

/// Disk-backed [`FsState`] resolving paths against a build root.
pub struct DiskState {
    root: Utf8PathBuf,
}

impl DiskState {
    /// Create an oracle rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FsState for DiskState {
    fn mtime(&self, path: &BuildPath) -> Option<SystemTime> {
        std::fs::metadata(path.reach(&self.root))
            .and_then(|meta| meta.modified())
            .ok()
    }
}

/// Runs actions under the session's concurrency bound.
pub struct Executor {
    root: Utf8PathBuf,
    mode: ExecMode,
    permits: Semaphore,
    stop: AtomicBool,
    running: AtomicUsize,
    peak: AtomicUsize,
}

/// Decrements the running-action gauge when an action finishes.
struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Executor {
    /// Create an executor rooted at `root` admitting at most `jobs`
    /// concurrently running actions.
    #[must_use]
    pub fn new(root: impl Into<Utf8PathBuf>, mode: ExecMode, jobs: usize) -> Self {
        Self {
            root: root.into(),
            mode,
            permits: Semaphore::new(jobs.max(1)),
            stop: AtomicBool::new(false),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// The build root actions resolve relative paths against.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Signal fail-fast: no new leaf action is admitted, but actions already
    /// running finish naturally.
    pub fn halt(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether fail-fast has been signalled.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Highest number of actions observed running at once this session.
    #[must_use]
    pub fn jobs_peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Execute `action` for `label`, then verify its declared `targets`.
    ///
    /// # Errors
    ///
    /// [`BuildError::Halted`] when fail-fast stopped admissions,
    /// [`BuildError::ActionExecutionFailure`] on process or I/O failure, and
    /// [`BuildError::TargetMismatch`] when the produced outputs disagree with
    /// the declaration.
    pub async fn run(
        &self,
        action: &Action,
        targets: &PathSet,
        label: &str,
    ) -> Result<(), BuildError> {
        if self.is_halted() {
            return Err(BuildError::Halted {
                target: label.to_owned(),
            });
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| BuildError::ActionExecutionFailure {
                target: label.to_owned(),
                detail: format!("scheduler shut down: {err}"),
            })?;
        // Re-check after potentially waiting for a permit: a sibling may have
        // failed while this action was queued.
        if self.is_halted() {
            return Err(BuildError::Halted {
                target: label.to_owned(),
            });
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _gauge = RunningGuard(&self.running);

        debug!(target = label, mode = ?self.mode, "running action");
        match self.mode {
            ExecMode::Direct => self.run_direct(action, targets, label).await,
            ExecMode::Sandboxed => self.run_sandboxed(action, targets, label).await,
        }
    }

    /// Execute an action that declares no outputs, e.g. an alias action.
    ///
    /// Runs in the shared root regardless of mode: there is no output set to
    /// protect, and nothing to verify afterwards.
    ///
    /// # Errors
    ///
    /// [`BuildError::Halted`] when fail-fast stopped admissions, and
    /// [`BuildError::ActionExecutionFailure`] on process or I/O failure.
    pub async fn run_unverified(&self, action: &Action, label: &str) -> Result<(), BuildError> {
        if self.is_halted() {
            return Err(BuildError::Halted {
                target: label.to_owned(),
            });
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| BuildError::ActionExecutionFailure {
                target: label.to_owned(),
                detail: format!("scheduler shut down: {err}"),
            })?;
        if self.is_halted() {
            return Err(BuildError::Halted {
                target: label.to_owned(),
            });
        }
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _gauge = RunningGuard(&self.running);
        debug!(target = label, "running unverified action");
        self.perform(action, &self.root, label).await
    }

    async fn run_direct(
        &self,
        action: &Action,
        targets: &PathSet,
        label: &str,
    ) -> Result<(), BuildError> {
        self.perform(action, &self.root, label).await?;
        let missing: Vec<BuildPath> = targets
            .iter()
            .filter(|t| !t.reach(&self.root).exists())
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BuildError::TargetMismatch {
                targets: targets.iter().cloned().collect(),
                missing,
                unexpected: Vec::new(),
            })
        }
    }

    async fn run_sandboxed(
        &self,
        action: &Action,
        targets: &PathSet,
        label: &str,
    ) -> Result<(), BuildError> {
        std::fs::create_dir_all(&self.root)
            .map_err(|err| BuildError::io(format!("create build root {}", self.root), &err))?;
        let staging = tempfile::Builder::new()
            .prefix(".kumade-stage.")
            .tempdir_in(&self.root)
            .map_err(|err| BuildError::io("create sandbox staging directory", &err))?;
        let staging_root = Utf8PathBuf::from_path_buf(staging.path().to_path_buf())
            .map_err(|path| BuildError::Io {
                context: "sandbox staging directory".into(),
                detail: format!("non UTF-8 path {}", path.display()),
            })?;

        self.perform(action, &staging_root, label).await?;

        let produced = collect_produced(&staging_root)?;
        let declared: PathSet = targets.clone();
        let missing: Vec<BuildPath> = declared
            .iter()
            .filter(|t| !produced.contains(*t))
            .cloned()
            .collect();
        let unexpected: Vec<BuildPath> = produced
            .iter()
            .filter(|p| !declared.contains(*p))
            .cloned()
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(BuildError::TargetMismatch {
                targets: declared.iter().cloned().collect(),
                missing,
                unexpected,
            });
        }

        for target in &declared {
            let from = target.reach(&staging_root);
            let to = target.reach(&self.root);
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| BuildError::io(format!("create directory {parent}"), &err))?;
            }
            std::fs::rename(&from, &to)
                .map_err(|err| BuildError::io(format!("move output into place: {to}"), &err))?;
        }
        Ok(())
    }

    /// Perform the raw operation with outputs resolved against `out_root`.
    async fn perform(
        &self,
        action: &Action,
        out_root: &Utf8Path,
        label: &str,
    ) -> Result<(), BuildError> {
        match action {
            Action::Command { program, args } => {
                let output = self.spawn(program, args, out_root, label).await?;
                if !output.stdout.is_empty() {
                    debug!(target = label, stdout = %String::from_utf8_lossy(&output.stdout).trim_end(), "action stdout");
                }
                Ok(())
            }
            Action::CommandToFile {
                program,
                args,
                stdout,
            } => {
                let output = self.spawn(program, args, out_root, label).await?;
                let dest = stdout.reach(out_root);
                ensure_parent(&dest)?;
                std::fs::write(&dest, &output.stdout)
                    .map_err(|err| BuildError::io(format!("write captured stdout to {dest}"), &err))
            }
            Action::Copy { src, dest } => {
                let from = src.reach(&self.root);
                let to = dest.reach(out_root);
                ensure_parent(&to)?;
                std::fs::copy(&from, &to)
                    .map(|_| ())
                    .map_err(|err| BuildError::io(format!("copy {from} to {to}"), &err))
            }
            Action::Symlink { original, link } => {
                let to = link.reach(out_root);
                ensure_parent(&to)?;
                make_symlink(original.as_path(), &to)
                    .map_err(|err| BuildError::io(format!("symlink {to} -> {original}"), &err))
            }
        }
    }

    async fn spawn(
        &self,
        program: &str,
        args: &[String],
        cwd: &Utf8Path,
        label: &str,
    ) -> Result<std::process::Output, BuildError> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(cwd)
            .env(ROOT_ENV, self.root.as_str())
            .output()
            .await
            .map_err(|err| BuildError::ActionExecutionFailure {
                target: label.to_owned(),
                detail: format!("failed to spawn '{program}': {err}"),
            })?;
        if output.status.success() {
            Ok(output)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(10)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            warn!(target = label, status = %output.status, "action failed");
            Err(BuildError::ActionExecutionFailure {
                target: label.to_owned(),
                detail: format!("'{program}' exited with {}: {tail}", output.status),
            })
        }
    }

    /// Compute-and-compare write: overwrite `path` only when `content`
    /// differs from the existing bytes, using a temp-file-and-rename so
    /// concurrent readers never observe a partial file.
    ///
    /// # Errors
    ///
    /// Returns an I/O diagnostic when the file cannot be read or replaced.
    pub fn write_if_changed(
        &self,
        path: &BuildPath,
        content: &[u8],
    ) -> Result<WriteOutcome, BuildError> {
        let dest = path.reach(&self.root);
        match std::fs::read(&dest) {
            Ok(existing) if existing == content => {
                debug!(path = %dest, "content unchanged, skipping write");
                return Ok(WriteOutcome::Unchanged);
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(BuildError::io(format!("read {dest}"), &err)),
        }
        ensure_parent(&dest)?;
        let parent = dest.parent().unwrap_or_else(|| Utf8Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|err| BuildError::io(format!("create temp file in {parent}"), &err))?;
        std::io::Write::write_all(&mut tmp, content)
            .map_err(|err| BuildError::io(format!("write temp file for {dest}"), &err))?;
        tmp.persist(&dest)
            .map_err(|err| BuildError::io(format!("replace {dest}"), &err.error))?;
        debug!(path = %dest, "content rewritten");
        Ok(WriteOutcome::Rewritten)
    }
}

fn ensure_parent(path: &Utf8Path) -> Result<(), BuildError> {
    if let Some(parent) = path.parent()
        && !parent.as_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|err| BuildError::io(format!("create directory {parent}"), &err))?;
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(original: &Utf8Path, link: &Utf8Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn make_symlink(original: &Utf8Path, link: &Utf8Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(original, link)
}

/// Walk a staging directory collecting every produced file, relative to it.
fn collect_produced(staging: &Utf8Path) -> Result<PathSet, BuildError> {
    fn walk(dir: &Utf8Path, base: &Utf8Path, acc: &mut PathSet) -> Result<(), BuildError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|err| BuildError::io(format!("read staging directory {dir}"), &err))?;
        for entry in entries {
            let entry =
                entry.map_err(|err| BuildError::io(format!("read staging entry in {dir}"), &err))?;
            let path = Utf8PathBuf::from_path_buf(entry.path()).map_err(|p| BuildError::Io {
                context: "staging directory entry".into(),
                detail: format!("non UTF-8 path {}", p.display()),
            })?;
            let file_type = entry
                .file_type()
                .map_err(|err| BuildError::io(format!("stat {path}"), &err))?;
            if file_type.is_dir() {
                walk(&path, base, acc)?;
            } else if let Ok(rel) = path.strip_prefix(base) {
                acc.insert(BuildPath::new(rel.to_path_buf()));
            }
        }
        Ok(())
    }

    let mut produced = PathSet::default();
    walk(staging, staging, &mut produced)?;
    Ok(produced)
}
