//! Flavor-specific shell knowledge: exclusion lists, forced options, tied
//! arrays and the capture function each flavor runs.

use crate::{CaptureMarkers, ShellState, ShellType};

/// bash rules and capture function
pub mod bash;

/// zsh rules and capture function
pub mod zsh;

/// Name of the shell function that prints a capture
pub const CAPTURE_FUNCTION: &str = "_shwire_capture";

/// Environment variable holding the path the exit trap writes to
pub const RTNSTATE_VAR: &str = "SHWIRE_RTNSTATE";

/// Static per-flavor rules
#[derive(Debug)]
pub struct ShellRules {
    /// Transient or internal variables dropped at capture
    pub excluded_vars: &'static [&'static str],
    /// Variables captured for option restoration but never re-declared
    pub option_vars: &'static [&'static str],
    /// Variables unset after restoration
    pub unset_vars: &'static [&'static str],
    /// Options the runtime controls and restoration must not touch
    pub forced_options: &'static [&'static str],
    /// Arrays whose elements are forced unique
    pub unique_arrays: &'static [&'static str],
    /// Scalar/array pairs the shell ties on its own
    pub builtin_ties: &'static [(&'static str, &'static str)],
    /// Statements that establish the option baseline
    pub baseline: &'static str,
}

impl ShellRules {
    /// Whether a captured variable should be dropped
    pub fn is_excluded(&self, name: &str) -> bool {
        is_engine_name(name) || self.excluded_vars.contains(&name)
    }

    /// Whether `(scalar, array)` is tied by the shell itself
    pub fn is_builtin_tie(&self, scalar: &str, array: &str) -> bool {
        self.builtin_ties.iter().any(|(s, a)| *s == scalar && *a == array)
    }
}

/// Rules for a flavor
pub fn rules(shell: ShellType) -> &'static ShellRules {
    match shell {
        ShellType::Bash => &bash::RULES,
        ShellType::Zsh => &zsh::RULES,
    }
}

/// Shell function that prints a full capture delimited by `markers`
pub fn capture_function(shell: ShellType, markers: &CaptureMarkers) -> String {
    let template = match shell {
        ShellType::Bash => bash::CAPTURE_TEMPLATE,
        ShellType::Zsh => zsh::CAPTURE_TEMPLATE,
    };
    template
        .replace("@START@", &markers.start_statement())
        .replace("@SEP@", &markers.section_statement())
        .replace("@END@", &markers.end_statement())
}

/// Statements that restore the options recorded in `state`
pub fn restore_options(shell: ShellType, state: &ShellState) -> Vec<String> {
    match shell {
        ShellType::Bash => bash::restore_options(state),
        ShellType::Zsh => zsh::restore_options(state),
    }
}

/// Names the engine itself uses; never captured or restored
pub fn is_engine_name(name: &str) -> bool {
    name.starts_with("_shwire") || name.starts_with("SHWIRE_")
}

/// Whether `name` is a plain identifier safe to interpolate into a script
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}
