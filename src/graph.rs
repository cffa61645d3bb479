//! Rule and alias registration.
//!
//! Registration is an explicit two-phase lifecycle: an open, additive
//! [`GraphBuilder`] phase in which rule producers register rules and alias
//! contributions in any order, followed by [`GraphBuilder::freeze`] which
//! produces the immutable [`BuildGraph`] snapshot the evaluator reads.
//! Nothing mutates after the freeze, so evaluation needs no locking around
//! these tables.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::warn;

use crate::errors::BuildError;
use crate::exec::Action;
use crate::expr::{BuildExpr, fanout, need_paths};
use crate::path::{BuildPath, PathSet};

/// How a rule declares its outputs.
#[derive(Clone, Debug)]
pub enum TargetSpec {
    /// An explicit output path set.
    Declared(PathSet),
    /// Outputs inferred from the action (copy destination, captured stdout,
    /// symlink location).
    Inferred,
}

/// A registered production rule: outputs, dependency expression, action.
///
/// Immutable once registered; owned by the graph's rule table and indexed by
/// each produced path.
#[derive(Debug)]
pub struct Rule {
    /// Every path this rule produces.
    pub targets: PathSet,
    /// The dependency expression evaluated before the action may run.
    pub deps: BuildExpr,
    /// The concrete action producing the targets.
    pub action: Action,
}

impl Rule {
    /// The rule's canonical target, used to key per-rule session state.
    #[must_use]
    pub fn primary_target(&self) -> Option<&BuildPath> {
        self.targets.first()
    }
}

/// Identity of an alias: its name scoped to a directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AliasId {
    /// The alias name, e.g. `test`.
    pub name: String,
    /// The directory the alias is scoped to.
    pub dir: BuildPath,
}

impl std::fmt::Display for AliasId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dir, self.name)
    }
}

/// Accumulating alias state during registration.
#[derive(Debug, Default)]
struct AliasDef {
    contributions: Vec<BuildExpr>,
    action: Option<Action>,
}

/// An alias frozen for evaluation: contributions folded into one expression.
#[derive(Debug)]
pub struct FrozenAlias {
    /// The alias identity.
    pub id: AliasId,
    /// The union of every registered contribution, folded as a fanout tree
    /// so independent contributions may evaluate concurrently.
    pub deps: BuildExpr,
    /// The alias's own action, run at most once per definition change.
    pub action: Option<Action>,
}

/// The open registration phase.
#[derive(Default)]
pub struct GraphBuilder {
    by_target: IndexMap<BuildPath, Arc<Rule>>,
    aliases: IndexMap<AliasId, AliasDef>,
}

impl GraphBuilder {
    /// Start an empty registration phase.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule mapping `targets` to `action` behind `deps`.
    ///
    /// # Errors
    ///
    /// [`BuildError::RuleWithoutTargets`] when no target can be resolved, and
    /// [`BuildError::DuplicateRule`] when another rule already produces one
    /// of the targets.
    pub fn register_rule(
        &mut self,
        targets: TargetSpec,
        deps: BuildExpr,
        action: Action,
    ) -> Result<(), BuildError> {
        let resolved = match targets {
            TargetSpec::Declared(set) => set,
            TargetSpec::Inferred => action.inferred_outputs(),
        };
        if resolved.is_empty() {
            return Err(BuildError::RuleWithoutTargets);
        }
        for target in &resolved {
            if self.by_target.contains_key(target) {
                return Err(BuildError::DuplicateRule {
                    target: target.clone(),
                });
            }
        }
        let rule = Arc::new(Rule {
            targets: resolved.clone(),
            deps,
            action,
        });
        for target in resolved {
            self.by_target.insert(target, Arc::clone(&rule));
        }
        Ok(())
    }

    /// Contribute dependencies (and optionally an action) to the alias
    /// `name` in `dir`.
    ///
    /// May be called any number of times for the same `(name, dir)` pair;
    /// the alias depends on the union of every contribution. The first
    /// registered action wins; later differing actions are ignored with a
    /// warning.
    pub fn register_alias(
        &mut self,
        name: &str,
        dir: impl Into<BuildPath>,
        deps: BuildExpr,
        action: Option<Action>,
    ) {
        let id = AliasId {
            name: name.to_owned(),
            dir: dir.into(),
        };
        let entry = self.aliases.entry(id.clone()).or_default();
        entry.contributions.push(deps);
        match (&entry.action, action) {
            (None, Some(act)) => entry.action = Some(act),
            (Some(existing), Some(act)) if *existing != act => {
                warn!(alias = %id, "ignoring conflicting action for already-registered alias");
            }
            _ => {}
        }
    }

    /// Close registration and produce the immutable evaluation snapshot.
    #[must_use]
    pub fn freeze(self) -> BuildGraph {
        let aliases = self
            .aliases
            .into_iter()
            .map(|(id, def)| {
                let deps = fold_contributions(def.contributions);
                (
                    id.clone(),
                    FrozenAlias {
                        id,
                        deps,
                        action: def.action,
                    },
                )
            })
            .collect();
        BuildGraph {
            by_target: self.by_target,
            aliases,
        }
    }
}

/// Fold alias contributions into one expression, pairing siblings with
/// fanout so they stay independently schedulable.
fn fold_contributions(contributions: Vec<BuildExpr>) -> BuildExpr {
    let mut iter = contributions.into_iter();
    let Some(first) = iter.next() else {
        return need_paths(PathSet::default());
    };
    iter.fold(first, fanout)
}

/// The frozen graph snapshot evaluated by a session.
pub struct BuildGraph {
    by_target: IndexMap<BuildPath, Arc<Rule>>,
    aliases: IndexMap<AliasId, FrozenAlias>,
}

impl BuildGraph {
    /// The rule producing `target`, if one was registered.
    #[must_use]
    pub fn rule_for(&self, target: &BuildPath) -> Option<&Arc<Rule>> {
        self.by_target.get(target)
    }

    /// The alias registered as `name` in `dir`.
    #[must_use]
    pub fn alias(&self, name: &str, dir: &BuildPath) -> Option<&FrozenAlias> {
        self.aliases.get(&AliasId {
            name: name.to_owned(),
            dir: dir.clone(),
        })
    }

    /// The first alias registered under `name` in any directory.
    #[must_use]
    pub fn find_alias(&self, name: &str) -> Option<&FrozenAlias> {
        self.aliases.values().find(|alias| alias.id.name == name)
    }

    /// Iterate every frozen alias.
    pub fn aliases(&self) -> impl Iterator<Item = &FrozenAlias> {
        self.aliases.values()
    }

    /// Iterate every registered target path.
    pub fn targets(&self) -> impl Iterator<Item = &BuildPath> {
        self.by_target.keys()
    }

    /// Number of distinct target paths.
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.by_target.len()
    }
}
