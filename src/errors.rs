//! Engine error types.
//!
//! Every failure the evaluator, scheduler, or action executor can surface is
//! a [`BuildError`]. The type is deliberately `Clone`: a failed target is
//! built at most once per session, and the one recorded error is shared with
//! every consumer that transitively required the target. Source errors are
//! therefore captured as rendered detail strings rather than held by value.

use miette::Diagnostic;
use thiserror::Error;

use crate::path::BuildPath;

/// Render a cycle as `a -> b -> a` for diagnostics.
fn fmt_cycle(cycle: &[BuildPath]) -> String {
    cycle
        .iter()
        .map(BuildPath::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Render a path list for mismatch diagnostics.
fn fmt_paths(paths: &[BuildPath]) -> String {
    paths
        .iter()
        .map(BuildPath::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while evaluating the build graph or executing actions.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum BuildError {
    /// The resolved dependency relation (including dynamically discovered
    /// edges) contains a cycle. Fatal for the whole evaluation.
    #[error("dependency cycle detected: {}", fmt_cycle(.cycle))]
    #[diagnostic(
        code(kumade::eval::dependency_cycle),
        help("one of the listed targets depends, possibly via discovered dependencies, on itself")
    )]
    DependencyCycle {
        /// The offending targets, first repeated at the end.
        cycle: Vec<BuildPath>,
    },

    /// A requested target has no producing rule and is absent on disk.
    #[error("no rule to build target '{target}'")]
    #[diagnostic(
        code(kumade::eval::no_rule_to_build_target),
        help("register a rule producing this path, or create it as a source file")
    )]
    NoRuleToBuildTarget {
        /// The unsatisfiable target.
        target: BuildPath,
    },

    /// Two rules were registered for the same output path.
    #[error("duplicate rule for target '{target}'")]
    #[diagnostic(code(kumade::graph::duplicate_rule))]
    DuplicateRule {
        /// The doubly produced target.
        target: BuildPath,
    },

    /// A rule was registered with no declared targets and an action whose
    /// outputs cannot be inferred.
    #[error("rule has no targets and its action implies none")]
    #[diagnostic(
        code(kumade::graph::rule_without_targets),
        help("declare targets explicitly, or use an action with an inherent output path")
    )]
    RuleWithoutTargets,

    /// A rule's declared outputs disagree with what its action produced.
    #[error(
        "action for [{}] produced the wrong outputs (missing: [{}]; unexpected: [{}])",
        fmt_paths(.targets),
        fmt_paths(.missing),
        fmt_paths(.unexpected)
    )]
    #[diagnostic(
        code(kumade::exec::target_mismatch),
        help("declared target paths must match the files the action writes, exactly")
    )]
    TargetMismatch {
        /// The declared target paths.
        targets: Vec<BuildPath>,
        /// Declared but not produced.
        missing: Vec<BuildPath>,
        /// Produced but not declared.
        unexpected: Vec<BuildPath>,
    },

    /// An action failed: non-zero exit status or an I/O error while running.
    #[error("action for '{target}' failed: {detail}")]
    #[diagnostic(code(kumade::exec::action_failure))]
    ActionExecutionFailure {
        /// The target (or alias) the action was producing.
        target: String,
        /// Rendered failure detail (exit status, stderr tail, or I/O error).
        detail: String,
    },

    /// An expression produced a value of the wrong shape, e.g. a `dyn_paths`
    /// inner expression that did not yield a path set.
    #[error("expression produced {found} where {expected} was required")]
    #[diagnostic(code(kumade::expr::value_shape))]
    ValueShape {
        /// The shape the consumer required.
        expected: &'static str,
        /// The shape actually produced.
        found: &'static str,
    },

    /// The build was halted (fail-fast) before this action could start.
    #[error("halted before building '{target}'")]
    #[diagnostic(code(kumade::schedule::halted))]
    Halted {
        /// The target whose action was never admitted.
        target: String,
    },

    /// An I/O failure outside action execution (digest sentinels, staleness
    /// probes, write-if-changed).
    #[error("{context}: {detail}")]
    #[diagnostic(code(kumade::io))]
    Io {
        /// What the engine was doing.
        context: String,
        /// Rendered underlying error.
        detail: String,
    },
}

impl BuildError {
    /// Wrap an I/O error with a contextual message.
    pub fn io(context: impl Into<String>, source: &std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            detail: source.to_string(),
        }
    }

    /// Whether this failure is the fail-fast skip marker rather than a
    /// genuine build failure.
    #[must_use]
    pub const fn is_halt(&self) -> bool {
        matches!(self, Self::Halted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_members_in_order() {
        let err = BuildError::DependencyCycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn mismatch_message_names_discrepancy() {
        let err = BuildError::TargetMismatch {
            targets: vec!["out.txt".into()],
            missing: vec!["out.txt".into()],
            unexpected: vec!["out2.txt".into()],
        };
        let message = err.to_string();
        assert!(message.contains("missing: [out.txt]"));
        assert!(message.contains("unexpected: [out2.txt]"));
    }
}
