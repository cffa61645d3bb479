//! The YAML rule-description layer.
//!
//! A `Kumadefile` is the thin "rule producer" glue in front of the engine:
//! it declares rules (targets, static deps, an optional depfile for dynamic
//! discovery, and an action) and aliases, and translates each stanza into
//! registrations on a [`GraphBuilder`]. The translation is deterministic and
//! non-recursive; all scheduling, staleness, and memoization semantics live
//! in the engine, never here.
//!
//! ```yaml
//! rules:
//!   - targets: [main.o]
//!     deps: [main.c]
//!     depfile: main.d
//!     command: cc -c main.c -o main.o
//!   - copy: { src: main.o, dest: dist/main.o }
//! aliases:
//!   - name: all
//!     deps: [dist/main.o]
//! ```

use camino::Utf8Path;
use miette::Diagnostic;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::errors::BuildError;
use crate::exec::Action;
use crate::expr::{BuildExpr, Value, dyn_paths, map, need_paths, pure, seq, then};
use crate::graph::{GraphBuilder, TargetSpec};
use crate::path::{PathSet, path_set};

/// Errors raised while loading or translating a `Kumadefile`.
#[derive(Debug, Error, Diagnostic)]
pub enum RulefileError {
    /// The rulefile could not be read.
    #[error("cannot read rulefile '{path}': {detail}")]
    #[diagnostic(code(kumade::rulefile::read))]
    Read {
        /// The path that was attempted.
        path: String,
        /// Rendered I/O error.
        detail: String,
    },

    /// The YAML did not parse into the expected schema.
    #[error("invalid rulefile: {detail}")]
    #[diagnostic(code(kumade::rulefile::parse))]
    Parse {
        /// Rendered parser diagnostic.
        detail: String,
    },

    /// A command string could not be split into program and arguments.
    #[error("unparseable command: {command}")]
    #[diagnostic(
        code(kumade::rulefile::bad_command),
        help("commands are split with POSIX shell word rules; check quoting")
    )]
    BadCommand {
        /// The offending command text.
        command: String,
    },

    /// A rule stanza declares zero or several operations.
    #[error("rule must declare exactly one of: command, copy, symlink")]
    #[diagnostic(code(kumade::rulefile::ambiguous_operation))]
    AmbiguousOperation,

    /// Registration was rejected by the engine.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] BuildError),
}

/// A parsed rulefile.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rulefile {
    /// Production rules, in declaration order.
    #[serde(default)]
    pub rules: Vec<RuleEntry>,
    /// Alias contributions, in declaration order.
    #[serde(default)]
    pub aliases: Vec<AliasEntry>,
}

/// One rule stanza.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleEntry {
    /// Declared outputs; may be omitted when the operation implies one.
    #[serde(default)]
    pub targets: Vec<String>,
    /// Static dependencies.
    #[serde(default)]
    pub deps: Vec<String>,
    /// A file naming additional dependencies discovered at build time.
    #[serde(default)]
    pub depfile: Option<String>,
    /// External command, split with shell word rules.
    #[serde(default)]
    pub command: Option<String>,
    /// Capture the command's stdout into this file instead of declaring an
    /// output the command writes itself.
    #[serde(default)]
    pub stdout_to: Option<String>,
    /// Built-in copy operation.
    #[serde(default)]
    pub copy: Option<CopySpec>,
    /// Built-in symlink operation.
    #[serde(default)]
    pub symlink: Option<SymlinkSpec>,
}

/// `copy: { src, dest }`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CopySpec {
    /// Source path.
    pub src: String,
    /// Destination path.
    pub dest: String,
}

/// `symlink: { original, link }`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SymlinkSpec {
    /// The path the link points at.
    pub original: String,
    /// The link to create.
    pub link: String,
}

/// One alias stanza.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasEntry {
    /// Alias name.
    pub name: String,
    /// Directory scope; defaults to the build root.
    #[serde(default = "default_dir")]
    pub dir: String,
    /// Paths the alias aggregates.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Optional action run when the alias definition changes.
    #[serde(default)]
    pub command: Option<String>,
}

fn default_dir() -> String {
    ".".to_owned()
}

/// Parse a rulefile from YAML text.
///
/// # Errors
///
/// Returns [`RulefileError::Parse`] on schema violations.
pub fn load_str(text: &str) -> Result<Rulefile, RulefileError> {
    serde_saphyr::from_str(text).map_err(|err| RulefileError::Parse {
        detail: err.to_string(),
    })
}

/// Read and parse a rulefile from disk.
///
/// # Errors
///
/// Returns [`RulefileError::Read`] when the file cannot be read and
/// [`RulefileError::Parse`] on schema violations.
pub fn load_path(path: &Utf8Path) -> Result<Rulefile, RulefileError> {
    let text = std::fs::read_to_string(path).map_err(|err| RulefileError::Read {
        path: path.to_string(),
        detail: err.to_string(),
    })?;
    load_str(&text)
}

/// Translate every stanza into registrations on `builder`.
///
/// `root` is the build root depfiles are resolved against when their
/// discovered paths are read back.
///
/// # Errors
///
/// Returns the first translation or registration error.
pub fn register(
    rulefile: Rulefile,
    root: &Utf8Path,
    builder: &mut GraphBuilder,
) -> Result<(), RulefileError> {
    for entry in rulefile.rules {
        let action = rule_action(&entry)?;
        let deps = dependency_expr(&entry, root);
        let targets = if entry.targets.is_empty() {
            TargetSpec::Inferred
        } else {
            TargetSpec::Declared(path_set(entry.targets))
        };
        builder.register_rule(targets, deps, action)?;
    }
    for entry in rulefile.aliases {
        let action = entry
            .command
            .as_deref()
            .map(command_action)
            .transpose()?;
        builder.register_alias(
            &entry.name,
            entry.dir.as_str(),
            need_paths(path_set(entry.deps)),
            action,
        );
    }
    Ok(())
}

/// Resolve the single operation a rule stanza declares.
fn rule_action(entry: &RuleEntry) -> Result<Action, RulefileError> {
    match (&entry.command, &entry.stdout_to, &entry.copy, &entry.symlink) {
        (Some(command), None, None, None) => command_action(command),
        (Some(command), Some(stdout), None, None) => {
            let (program, args) = split_command(command)?;
            Ok(Action::CommandToFile {
                program,
                args,
                stdout: stdout.as_str().into(),
            })
        }
        (None, None, Some(copy), None) => Ok(Action::Copy {
            src: copy.src.as_str().into(),
            dest: copy.dest.as_str().into(),
        }),
        (None, None, None, Some(symlink)) => Ok(Action::Symlink {
            original: symlink.original.as_str().into(),
            link: symlink.link.as_str().into(),
        }),
        _ => Err(RulefileError::AmbiguousOperation),
    }
}

fn command_action(command: &str) -> Result<Action, RulefileError> {
    let (program, args) = split_command(command)?;
    Ok(Action::Command { program, args })
}

fn split_command(command: &str) -> Result<(String, Vec<String>), RulefileError> {
    let mut words = shlex::split(command)
        .filter(|words| !words.is_empty())
        .ok_or_else(|| RulefileError::BadCommand {
            command: command.to_owned(),
        })?
        .into_iter();
    let program = words.next().ok_or_else(|| RulefileError::BadCommand {
        command: command.to_owned(),
    })?;
    Ok((program, words.collect()))
}

/// Build the rule's dependency expression: static deps, then (optionally)
/// dynamic discovery from the depfile.
fn dependency_expr(entry: &RuleEntry, root: &Utf8Path) -> BuildExpr {
    let static_deps = need_paths(path_set(entry.deps.iter().map(String::as_str)));
    let Some(depfile) = &entry.depfile else {
        return static_deps;
    };
    let depfile_rel = depfile.clone();
    let depfile_abs = root.join(depfile.as_str());
    let discovery = {
        let depfile_abs = depfile_abs.clone();
        map(pure(Value::Unit), move |_| {
            Ok(Value::Paths(read_depfile(&depfile_abs)))
        })
    };
    // The depfile only becomes a dependency once it exists: on a clean build
    // the action itself emits it (cc -MD style) and the discovery is empty
    // until then. Decided at evaluation time, not registration time.
    let dynamic = seq(pure(Value::Unit), move |_| {
        if depfile_abs.exists() {
            then(
                need_paths(path_set([depfile_rel.as_str()])),
                dyn_paths(discovery.clone()),
            )
        } else {
            dyn_paths(discovery.clone())
        }
    });
    then(static_deps, dynamic)
}

/// Read a depfile's discovered paths: whitespace separated, make-style
/// `target:` prefixes skipped. A missing depfile is an empty discovery; the
/// file appears on the next build once its producing rule has run.
fn read_depfile(path: &Utf8Path) -> PathSet {
    let Ok(text) = std::fs::read_to_string(path) else {
        debug!(path = %path, "depfile absent, no discovered dependencies");
        return PathSet::default();
    };
    text.split_whitespace()
        .filter(|token| !token.ends_with(':') && *token != "\\")
        .map(Into::into)
        .collect()
}
