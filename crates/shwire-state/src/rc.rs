//! RC script synthesis.
//!
//! Compiles a [`ShellState`] into a script that, sourced by a fresh
//! non-interactive shell, reconstructs that state. Blocks are emitted in a
//! fixed order: option baseline, modules, variables, deny-list unsets,
//! aliases, functions, option restoration.

use crate::shell::{self, is_valid_name, ShellRules, CAPTURE_FUNCTION, RTNSTATE_VAR};
use crate::{AliasKind, CaptureMarkers, ShellFunc, ShellState, ShellType, ShellVar, StateError, VarValue};
use std::borrow::Cow;
use tracing::warn;

/// Header comments opening each block, in emission order
pub const BLOCK_HEADERS: [&str; 7] = [
    "# baseline",
    "# modules",
    "# variables",
    "# unset",
    "# aliases",
    "# functions",
    "# options",
];

/// Build the rc script for `state`
pub fn synthesize_rc(shell: ShellType, state: &ShellState) -> Result<String, StateError> {
    let flavor = state.shell_type()?;
    if flavor != shell {
        return Err(StateError::VersionMismatch {
            base: shell.to_string(),
            target: state.version.clone(),
        });
    }
    let rules = shell::rules(shell);
    let mut out = String::new();

    push_block(&mut out, BLOCK_HEADERS[0], [rules.baseline.to_string()]);

    let modules = match shell {
        ShellType::Zsh => state
            .modules
            .iter()
            .filter_map(|module| quote_or_warn(module, module).map(|q| format!("zmodload -i {} 2>/dev/null", q)))
            .collect(),
        ShellType::Bash => Vec::new(),
    };
    push_block(&mut out, BLOCK_HEADERS[1], modules);

    let mut vars = Vec::new();
    let mut trailer = Vec::new();
    for (name, var) in &state.vars {
        emit_var(shell, rules, name, var, &mut vars, &mut trailer);
    }
    vars.extend(trailer);
    push_block(&mut out, BLOCK_HEADERS[2], vars);

    let unsets = rules
        .unset_vars
        .iter()
        .map(|name| format!("unset -v {} 2>/dev/null", name))
        .collect::<Vec<_>>();
    push_block(&mut out, BLOCK_HEADERS[3], unsets);

    let mut aliases = Vec::new();
    for alias in state.aliases.values() {
        let flag = match (shell, alias.kind) {
            (_, AliasKind::Regular) => "",
            (ShellType::Zsh, AliasKind::Global) => "-g ",
            (ShellType::Zsh, AliasKind::Suffix) => "-s ",
            (ShellType::Bash, kind) => {
                warn!("bash has no {} aliases, skipping {}", kind.as_str(), alias.name);
                continue;
            }
        };
        let assignment = format!("{}={}", alias.name, alias.value);
        if let Some(quoted) = quote_or_warn(&alias.name, &assignment) {
            aliases.push(format!("alias {}-- {}", flag, quoted));
        }
    }
    push_block(&mut out, BLOCK_HEADERS[4], aliases);

    let mut funcs = Vec::new();
    for (name, func) in &state.funcs {
        match (func, shell) {
            (ShellFunc::Inline(body), _) => funcs.push(body.clone()),
            (ShellFunc::Autoload, ShellType::Zsh) => {
                if let Some(quoted) = quote_or_warn(name, name) {
                    funcs.push(format!("autoload -Uz -- {}", quoted));
                }
            }
            (ShellFunc::Autoload, ShellType::Bash) => {
                warn!("bash cannot autoload function {}, skipping", name);
            }
        }
    }
    push_block(&mut out, BLOCK_HEADERS[5], funcs);

    push_block(&mut out, BLOCK_HEADERS[6], shell::restore_options(shell, state));

    Ok(out)
}

/// Capture function plus an EXIT trap that writes the final state to the
/// file named by `SHWIRE_RTNSTATE`
pub fn exit_trap(shell: ShellType, markers: &CaptureMarkers) -> String {
    format!(
        "{}\ntrap '{} > \"${}\" 2>/dev/null' EXIT\n",
        shell::capture_function(shell, markers),
        CAPTURE_FUNCTION,
        RTNSTATE_VAR
    )
}

fn push_block<I>(out: &mut String, header: &str, lines: I)
where
    I: IntoIterator<Item = String>,
{
    out.push_str(header);
    out.push('\n');
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
}

fn quote_or_warn<'a>(name: &str, value: &'a str) -> Option<Cow<'a, str>> {
    match shlex::try_quote(value) {
        Ok(quoted) => Some(quoted),
        Err(e) => {
            warn!("cannot quote value for {}: {}", name, e);
            None
        }
    }
}

fn emit_var(
    shell: ShellType,
    rules: &ShellRules,
    name: &str,
    var: &ShellVar,
    lines: &mut Vec<String>,
    trailer: &mut Vec<String>,
) {
    if !is_valid_name(name) {
        warn!("skipping unsafe variable name {:?}", name);
        return;
    }
    if rules.is_excluded(name) || rules.option_vars.contains(&name) {
        return;
    }

    if shell == ShellType::Zsh && var.flags.tied {
        if let Some(partner) = &var.tied_to {
            if !is_valid_name(partner) {
                warn!("skipping {} tied to unsafe name {:?}", name, partner);
                return;
            }
            if !var.flags.array {
                if var.flags.exported {
                    trailer.push(format!("export {}", name));
                }
                return;
            }
            let Some(value) = render_value(shell, name, &var.value) else {
                return;
            };
            if !rules.is_builtin_tie(partner, name) {
                lines.push(format!("(( ${{+{}}} )) || typeset -T {} {}", name, partner, name));
            }
            lines.push(format!("{}{}", name, value));
            if var.flags.unique {
                trailer.push(format!("typeset -U {}", name));
            }
            return;
        }
    }

    let Some(value) = render_value(shell, name, &var.value) else {
        return;
    };
    let statement = format!("{} {} {}{}", keyword(shell), flag_word(shell, var), name, value);
    if var.flags.readonly {
        lines.push(format!("{} || {}", bound_check(shell, name), statement));
    } else {
        lines.push(statement);
    }
    if shell == ShellType::Zsh && var.flags.unique && !var.flags.readonly {
        trailer.push(format!("typeset -U {}", name));
    }
}

fn keyword(shell: ShellType) -> &'static str {
    match shell {
        ShellType::Bash => "declare",
        ShellType::Zsh => "typeset",
    }
}

fn bound_check(shell: ShellType, name: &str) -> String {
    match shell {
        ShellType::Bash => format!("declare -p {} >/dev/null 2>&1", name),
        ShellType::Zsh => format!("(( ${{+{}}} ))", name),
    }
}

fn flag_word(shell: ShellType, var: &ShellVar) -> String {
    let flags = &var.flags;
    let mut letters = String::new();
    if flags.assoc || matches!(var.value, VarValue::Assoc(_)) {
        letters.push('A');
    } else if flags.array || matches!(var.value, VarValue::Array(_)) {
        letters.push('a');
    }
    if flags.integer {
        letters.push('i');
    }
    if flags.exported {
        letters.push('x');
    }
    if flags.readonly {
        letters.push('r');
    }
    if flags.nameref && shell == ShellType::Bash {
        letters.push('n');
    }
    match (letters.is_empty(), shell) {
        (true, ShellType::Bash) => "--".to_string(),
        (true, ShellType::Zsh) => "+x".to_string(),
        (false, _) => format!("-{}", letters),
    }
}

/// `=value` suffix for a declaration, or `None` if a value cannot be quoted
fn render_value(shell: ShellType, name: &str, value: &VarValue) -> Option<String> {
    match value {
        VarValue::Unset => Some(String::new()),
        VarValue::Scalar(s) => quote_or_warn(name, s).map(|q| format!("={}", q)),
        VarValue::Array(items) => {
            let quoted = items
                .iter()
                .map(|item| quote_or_warn(name, item))
                .collect::<Option<Vec<_>>>()?;
            Some(match shell {
                ShellType::Bash => format!("=({})", quoted.join(" ")),
                ShellType::Zsh => format!("=( {} )", quoted.join(" ")),
            })
        }
        VarValue::Assoc(map) => {
            let mut parts = Vec::with_capacity(map.len());
            for (key, item) in map {
                let k = quote_or_warn(name, key)?;
                let v = quote_or_warn(name, item)?;
                parts.push(match shell {
                    ShellType::Bash => format!("[{}]={}", k, v),
                    ShellType::Zsh => format!("{} {}", k, v),
                });
            }
            Some(match shell {
                ShellType::Bash => format!("=({})", parts.join(" ")),
                ShellType::Zsh => format!("=( {} )", parts.join(" ")),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ShellAlias, VarFlags};

    fn positions(rc: &str) -> Vec<usize> {
        BLOCK_HEADERS
            .iter()
            .map(|h| rc.find(&format!("{}\n", h)).unwrap_or_else(|| panic!("missing {h}")))
            .collect()
    }

    fn bash_state() -> ShellState {
        let mut state = ShellState::new("bash v5.2.15(1)-release", "/tmp");
        state.vars.insert("GREETING".to_string(), ShellVar::exported("it's a \"test\""));
        state.vars.insert("list".to_string(), ShellVar::array(["a", "b c"]));
        state.vars.insert(
            "LOCKED".to_string(),
            ShellVar {
                flags: VarFlags {
                    readonly: true,
                    ..VarFlags::default()
                },
                value: VarValue::Scalar("1".to_string()),
                tied_to: None,
            },
        );
        state.vars.insert("x;rm -rf /".to_string(), ShellVar::scalar("boom"));
        state.vars.insert("BASHPID".to_string(), ShellVar::scalar("12"));
        state.vars.insert("SHELLOPTS".to_string(), ShellVar::scalar("braceexpand:pipefail"));
        state.insert_alias(ShellAlias::new(AliasKind::Regular, "ll", "ls -l"));
        state.funcs.insert("greet".to_string(), ShellFunc::Inline("greet () \n{ \n    echo hi\n}".to_string()));
        state
    }

    #[test]
    fn test_block_order() {
        let rc = synthesize_rc(ShellType::Bash, &bash_state()).unwrap();
        let pos = positions(&rc);
        assert!(pos.windows(2).all(|w| w[0] < w[1]), "{rc}");

        let vars_at = rc.find("GREETING").unwrap();
        let alias_at = rc.find("alias -- ").unwrap();
        let func_at = rc.find("greet ()").unwrap();
        let opt_at = rc.find("set -o pipefail").unwrap();
        assert!(pos[2] < vars_at && vars_at < pos[3]);
        assert!(pos[4] < alias_at && alias_at < pos[5]);
        assert!(pos[5] < func_at && func_at < pos[6]);
        assert!(pos[6] < opt_at);
    }

    #[test]
    fn test_bash_declarations() {
        let rc = synthesize_rc(ShellType::Bash, &bash_state()).unwrap();
        assert!(rc.contains("shopt -s expand_aliases"));
        assert!(rc.contains("declare -a list=(a 'b c')"));
        assert!(rc.contains("declare -p LOCKED >/dev/null 2>&1 || declare -r LOCKED=1"));
        assert!(rc.contains("alias -- 'll=ls -l'"));
        assert!(rc.contains("unset -v PROMPT_COMMAND 2>/dev/null"));
        assert!(!rc.contains("rm -rf"));
        assert!(!rc.contains("BASHPID"));
        assert!(!rc.contains("declare -- SHELLOPTS"));
    }

    #[test]
    fn test_values_are_escaped() {
        let rc = synthesize_rc(ShellType::Bash, &bash_state()).unwrap();
        let line = rc.lines().find(|l| l.contains("GREETING")).unwrap();
        assert!(line.starts_with("declare -x GREETING="));
        let quoted = &line["declare -x GREETING=".len()..];
        assert_eq!(shlex::split(quoted).unwrap(), vec!["it's a \"test\"".to_string()]);
    }

    #[test]
    fn test_nul_values_dropped() {
        let mut state = bash_state();
        state.vars.insert("BAD".to_string(), ShellVar::scalar("a\0b"));
        let rc = synthesize_rc(ShellType::Bash, &state).unwrap();
        assert!(!rc.contains("BAD"));
    }

    #[test]
    fn test_zsh_specifics() {
        let mut state = ShellState::new("zsh v5.9", "/");
        state.modules = vec!["zsh/complist".to_string()];
        let mut path = ShellVar::array(["/usr/bin", "/bin"]);
        path.flags.tied = true;
        path.flags.unique = true;
        path.tied_to = Some("PATH".to_string());
        state.vars.insert("path".to_string(), path);
        let mut scalar = ShellVar::exported("");
        scalar.value = VarValue::Unset;
        scalar.flags.tied = true;
        scalar.tied_to = Some("path".to_string());
        state.vars.insert("PATH".to_string(), scalar);
        let mut mine = ShellVar::array(["x"]);
        mine.flags.tied = true;
        mine.tied_to = Some("MINE".to_string());
        state.vars.insert("mine".to_string(), mine);
        state.insert_alias(ShellAlias::new(AliasKind::Global, "G", "| grep"));
        state.funcs.insert("compinit".to_string(), ShellFunc::Autoload);

        let rc = synthesize_rc(ShellType::Zsh, &state).unwrap();
        assert!(rc.contains("unsetopt banghist"));
        assert!(rc.contains("zmodload -i ") && rc.contains("complist"));
        assert!(rc.contains("\npath=( "));
        assert!(!rc.contains("typeset -T PATH path"));
        assert!(rc.contains("(( ${+mine} )) || typeset -T MINE mine"));
        assert!(rc.contains("typeset -U path"));
        assert!(rc.contains("export PATH"));
        assert!(rc.contains("alias -g -- 'G=| grep'"));
        assert!(rc.contains("autoload -Uz -- compinit"));
        assert!(positions(&rc).windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_flavor_must_match() {
        let err = synthesize_rc(ShellType::Zsh, &bash_state()).unwrap_err();
        assert!(err.is_version_mismatch());
    }

    #[test]
    fn test_exit_trap() {
        let markers = CaptureMarkers::generate();
        let trap = exit_trap(ShellType::Bash, &markers);
        assert!(trap.starts_with(CAPTURE_FUNCTION));
        assert!(trap.contains("trap '_shwire_capture > \"$SHWIRE_RTNSTATE\" 2>/dev/null' EXIT"));
    }
}
