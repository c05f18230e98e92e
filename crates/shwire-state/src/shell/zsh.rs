//! zsh rules and capture function

use super::ShellRules;
use crate::{ShellState, VarValue};

/// zsh rules
pub static RULES: ShellRules = ShellRules {
    excluded_vars: &[
        "_", "ARGC", "argv", "COLUMNS", "LINES", "EGID", "EUID", "GID", "UID", "ERRNO",
        "HISTCMD", "LINENO", "PPID", "PWD", "OLDPWD", "RANDOM", "SRANDOM", "SECONDS", "SHLVL",
        "TTY", "TTYIDLE", "ZSH_ARGZERO", "ZSH_EVAL_CONTEXT", "zsh_eval_context", "ZSH_NAME",
        "ZSH_PATCHLEVEL", "ZSH_SUBSHELL", "ZSH_VERSION", "ZSH_EXECUTION_STRING",
        "EPOCHSECONDS", "EPOCHREALTIME", "epochtime", "funcfiletrace", "funcsourcetrace",
        "funcstack", "functrace", "pipestatus", "status", "signals", "TRY_BLOCK_ERROR",
        "TRY_BLOCK_INTERRUPT", "parameters", "commands", "functions", "functions_source",
        "dis_functions", "dis_functions_source", "builtins", "dis_builtins", "aliases",
        "dis_aliases", "galiases", "dis_galiases", "saliases", "dis_saliases", "modules",
        "dirstack", "history", "historywords", "jobdirs", "jobstates", "jobtexts", "nameddirs",
        "userdirs", "usergroups", "reswords", "dis_reswords", "patchars", "dis_patchars",
        "widgets", "keymaps", "termcap", "terminfo", "mapfile", "sysparams", "errnos",
        "zle_bracketed_paste", "ZLE_RPROMPT_INDENT", "KEYS_QUEUED_COUNT", "PENDING",
    ],
    option_vars: &["options"],
    unset_vars: &["TMOUT", "HISTFILE", "precmd_functions", "preexec_functions"],
    forced_options: &[
        "interactive", "login", "monitor", "zle", "shinstdin", "privileged", "restricted",
        "singlecommand", "banghist", "rcs", "globalrcs",
    ],
    unique_arrays: &["path", "fpath", "cdpath", "manpath", "module_path"],
    builtin_ties: &[
        ("PATH", "path"),
        ("FPATH", "fpath"),
        ("CDPATH", "cdpath"),
        ("MANPATH", "manpath"),
        ("MODULE_PATH", "module_path"),
        ("FIGNORE", "fignore"),
        ("MAILPATH", "mailpath"),
        ("PSVAR", "psvar"),
    ],
    baseline: "unsetopt banghist monitor zle 2>/dev/null",
};

pub(crate) const CAPTURE_TEMPLATE: &str = r#"_shwire_capture() {
    local _shwire_optrec="$(typeset -p options 2>/dev/null)"
    emulate -L zsh
    local _shwire_name _shwire_value _shwire_src
    @START@
    printf 'zsh v%s' "$ZSH_VERSION"
    @SEP@
    printf '%s' "$PWD"
    @SEP@
    env -0 2>/dev/null || true
    @SEP@
    printf '%s\0' ${(f)"$(zmodload)"}
    @SEP@
    printf '%s\0' "$_shwire_optrec"
    for _shwire_name in ${(k)parameters}; do
        [[ $_shwire_name == options ]] && continue
        typeset -p -- "$_shwire_name" 2>/dev/null || true
        printf '\0'
    done
    @SEP@
    for _shwire_name _shwire_value in "${(@kv)aliases}"; do
        printf 'regular\0%s\0%s\0' "$_shwire_name" "$_shwire_value"
    done
    for _shwire_name _shwire_value in "${(@kv)galiases}"; do
        printf 'global\0%s\0%s\0' "$_shwire_name" "$_shwire_value"
    done
    for _shwire_name _shwire_value in "${(@kv)saliases}"; do
        printf 'suffix\0%s\0%s\0' "$_shwire_name" "$_shwire_value"
    done
    @SEP@
    for _shwire_name in ${(k)functions}; do
        printf '%s\0' "$_shwire_name"
        _shwire_src="${functions_source[$_shwire_name]-}"
        if [[ "${functions[$_shwire_name]}" == *"builtin autoload -X"* ]]; then
            printf 'autoload'
        elif [[ -n "$_shwire_src" ]] && (( ${fpath[(Ie)${_shwire_src:h}]} )); then
            printf 'autoload'
        else
            functions -- "$_shwire_name" || true
        fi
        printf '\0'
    done
    @SEP@
    if (( $+commands[git] )); then
        printf 'git_branch\0%s\0' "$(git rev-parse --abbrev-ref HEAD 2>/dev/null)"
    fi
    if (( $+commands[kubectl] )); then
        printf 'kube_context\0%s\0' "$(kubectl config current-context 2>/dev/null)"
    fi
    @SEP@
    print -rn -- "${(%%)PS1}"
    @END@
}"#;

pub(crate) fn restore_options(state: &ShellState) -> Vec<String> {
    let Some(VarValue::Assoc(options)) = state.vars.get("options").map(|v| &v.value) else {
        return Vec::new();
    };
    options
        .iter()
        .filter(|(name, _)| is_option_name(name) && !RULES.forced_options.contains(&name.as_str()))
        .filter_map(|(name, value)| match value.as_str() {
            "on" => Some(format!("setopt {} 2>/dev/null", name)),
            "off" => Some(format!("unsetopt {} 2>/dev/null", name)),
            _ => None,
        })
        .collect()
}

fn is_option_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
