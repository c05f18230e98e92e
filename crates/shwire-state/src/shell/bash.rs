//! bash rules and capture function

use super::ShellRules;
use crate::{ShellState, VarValue};

/// bash rules
pub static RULES: ShellRules = ShellRules {
    excluded_vars: &[
        "_", "BASH", "BASHPID", "BASH_ALIASES", "BASH_ARGC", "BASH_ARGV", "BASH_ARGV0",
        "BASH_CMDS", "BASH_COMMAND", "BASH_EXECUTION_STRING", "BASH_LINENO", "BASH_REMATCH",
        "BASH_SOURCE", "BASH_SUBSHELL", "BASH_VERSINFO", "BASH_VERSION", "COLUMNS",
        "COMP_WORDBREAKS", "DIRSTACK", "EPOCHREALTIME", "EPOCHSECONDS", "EUID", "FUNCNAME",
        "GROUPS", "HISTCMD", "HOSTNAME", "HOSTTYPE", "LINENO", "LINES", "MACHTYPE", "OLDPWD",
        "OPTERR", "OPTIND", "OSTYPE", "PIPESTATUS", "PPID", "PWD", "RANDOM", "SECONDS", "SHLVL",
        "SRANDOM", "UID",
    ],
    option_vars: &["SHELLOPTS", "BASHOPTS"],
    unset_vars: &["PROMPT_COMMAND", "BASH_ENV", "ENV", "TMOUT", "HISTFILE"],
    forced_options: &[
        "history", "histexpand", "monitor", "emacs", "vi", "onecmd", "privileged",
        "login_shell", "restricted_shell", "expand_aliases", "progcomp", "progcomp_alias",
    ],
    unique_arrays: &[],
    builtin_ties: &[],
    baseline: "set +o history +o histexpand +o monitor 2>/dev/null\nshopt -s expand_aliases",
};

pub(crate) const CAPTURE_TEMPLATE: &str = r#"_shwire_capture() {
    local IFS=$' \t\n'
    local _shwire_name _shwire_ps1
    @START@
    printf 'bash v%s' "$BASH_VERSION"
    @SEP@
    printf '%s' "$PWD"
    @SEP@
    env -0 2>/dev/null || true
    @SEP@
    @SEP@
    for _shwire_name in $(compgen -A variable); do
        declare -p -- "$_shwire_name" 2>/dev/null || true
        printf '\0'
    done
    @SEP@
    for _shwire_name in "${!BASH_ALIASES[@]}"; do
        printf 'regular\0%s\0%s\0' "$_shwire_name" "${BASH_ALIASES[$_shwire_name]}"
    done
    @SEP@
    for _shwire_name in $(compgen -A function); do
        printf '%s\0' "$_shwire_name"
        declare -f -- "$_shwire_name" || true
        printf '\0'
    done
    @SEP@
    if command -v git >/dev/null 2>&1; then
        printf 'git_branch\0%s\0' "$(git rev-parse --abbrev-ref HEAD 2>/dev/null)"
    fi
    if command -v kubectl >/dev/null 2>&1; then
        printf 'kube_context\0%s\0' "$(kubectl config current-context 2>/dev/null)"
    fi
    @SEP@
    _shwire_ps1="${PS1-}"
    printf '%s' "${_shwire_ps1@P}" 2>/dev/null || true
    @END@
}"#;

pub(crate) fn restore_options(state: &ShellState) -> Vec<String> {
    let mut lines = Vec::new();
    for (var, command) in [("SHELLOPTS", "set -o"), ("BASHOPTS", "shopt -s")] {
        let Some(VarValue::Scalar(list)) = state.vars.get(var).map(|v| &v.value) else {
            continue;
        };
        for option in list.split(':').filter(|o| is_option_name(o)) {
            if RULES.forced_options.contains(&option) {
                continue;
            }
            lines.push(format!("{} {} 2>/dev/null", command, option));
        }
    }
    lines
}

fn is_option_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
