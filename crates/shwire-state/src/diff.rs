//! State diff and patch

use crate::{MapDiff, PromptInfo, ShellAlias, ShellFunc, ShellState, ShellVar, StateError};
use serde::{Deserialize, Serialize};

/// Incremental update from one [`ShellState`] to another.
///
/// Anchored to the hash of its base; applying it to any other state fails.
/// The target's version and error always travel with the diff, so
/// `apply(base, between(base, target)) == target` holds exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellStateDiff {
    /// Hash of the base state
    pub base_hash: String,
    /// Version banner of the target
    pub version: String,
    /// New working directory, if changed
    pub cwd: Option<String>,
    /// New module list, if changed
    pub modules: Option<Vec<String>>,
    /// Variable changes
    pub vars: MapDiff<ShellVar>,
    /// Alias changes
    pub aliases: MapDiff<ShellAlias>,
    /// Function changes
    pub funcs: MapDiff<ShellFunc>,
    /// New prompt information, if changed
    pub prompt: Option<PromptInfo>,
    /// Target's capture error
    pub error: Option<String>,
}

impl ShellStateDiff {
    /// Compute the diff from `base` to `target`
    pub fn between(base: &ShellState, target: &ShellState) -> Result<Self, StateError> {
        base.ensure_same_family(target)?;

        Ok(Self {
            base_hash: base.hash()?,
            version: target.version.clone(),
            cwd: changed(&base.cwd, &target.cwd),
            modules: changed(&base.modules, &target.modules),
            vars: MapDiff::between(&base.vars, &target.vars),
            aliases: MapDiff::between(&base.aliases, &target.aliases),
            funcs: MapDiff::between(&base.funcs, &target.funcs),
            prompt: changed(&base.prompt, &target.prompt),
            error: target.error.clone(),
        })
    }

    /// Apply this diff to `base`, producing the target state
    pub fn apply(&self, base: &ShellState) -> Result<ShellState, StateError> {
        let actual = base.hash()?;
        if actual != self.base_hash {
            return Err(StateError::BaseHashMismatch {
                expected: self.base_hash.clone(),
                actual,
            });
        }
        let target_family = ShellState::new(self.version.clone(), String::new());
        base.ensure_same_family(&target_family)?;

        Ok(ShellState {
            version: self.version.clone(),
            cwd: self.cwd.clone().unwrap_or_else(|| base.cwd.clone()),
            modules: self.modules.clone().unwrap_or_else(|| base.modules.clone()),
            vars: self.vars.apply(&base.vars),
            aliases: self.aliases.apply(&base.aliases),
            funcs: self.funcs.apply(&base.funcs),
            prompt: self.prompt.clone().unwrap_or_else(|| base.prompt.clone()),
            error: self.error.clone(),
        })
    }

    /// True when no field other than the carried version and error changes
    pub fn is_empty(&self) -> bool {
        self.cwd.is_none()
            && self.modules.is_none()
            && self.prompt.is_none()
            && self.vars.is_empty()
            && self.aliases.is_empty()
            && self.funcs.is_empty()
    }
}

fn changed<T: Clone + PartialEq>(base: &T, target: &T) -> Option<T> {
    (base != target).then(|| target.clone())
}
