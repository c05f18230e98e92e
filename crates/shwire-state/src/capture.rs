//! Capture script generation and output parsing.
//!
//! A capture prints nine sections in a fixed order: version banner, cwd,
//! environment, modules, variable declarations, aliases, functions, hooks and
//! the rendered prompt. Sections are delimited by markers built from two
//! random tokens; the script prints them with `printf` from separate
//! arguments so the script text itself never contains a contiguous marker.

use crate::decl::parse_declaration;
use crate::shell::{self, is_valid_name, CAPTURE_FUNCTION};
use crate::{AliasKind, ShellAlias, ShellFunc, ShellState, ShellType, ShellVar, StateError, VersionFamily};
use rand::Rng;
use tracing::debug;

/// Number of sections in a capture
pub const SECTION_COUNT: usize = 9;

const MARKER_FENCE: &[u8] = b"\x1e\x1e";

/// Randomized delimiters for one capture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureMarkers {
    token_a: String,
    token_b: String,
}

impl CaptureMarkers {
    /// Fresh random markers
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            token_a: format!("{:016x}", rng.gen::<u64>()),
            token_b: format!("{:016x}", rng.gen::<u64>()),
        }
    }

    /// Markers from fixed alphanumeric tokens
    pub fn from_tokens(token_a: impl Into<String>, token_b: impl Into<String>) -> Self {
        Self {
            token_a: token_a.into(),
            token_b: token_b.into(),
        }
    }

    fn marker(&self, kind: u8) -> Vec<u8> {
        let mut marker = Vec::with_capacity(5 + self.token_a.len() + self.token_b.len());
        marker.extend_from_slice(MARKER_FENCE);
        marker.push(kind);
        marker.extend_from_slice(self.token_a.as_bytes());
        marker.extend_from_slice(self.token_b.as_bytes());
        marker.extend_from_slice(MARKER_FENCE);
        marker
    }

    fn statement(&self, kind: char) -> String {
        format!(
            "printf '\\036\\036%s%s%s\\036\\036' {} {} {}",
            kind, self.token_a, self.token_b
        )
    }

    /// Bytes that open a capture
    pub fn start(&self) -> Vec<u8> {
        self.marker(b'S')
    }

    /// Bytes between two sections
    pub fn section(&self) -> Vec<u8> {
        self.marker(b'D')
    }

    /// Bytes that close a capture
    pub fn end(&self) -> Vec<u8> {
        self.marker(b'E')
    }

    pub(crate) fn start_statement(&self) -> String {
        self.statement('S')
    }

    pub(crate) fn section_statement(&self) -> String {
        self.statement('D')
    }

    pub(crate) fn end_statement(&self) -> String {
        self.statement('E')
    }
}

/// Standalone script that captures the current shell to stdout.
///
/// Meant for `bash -l -i -c` / `zsh -l -i -c` under a pty: it turns off
/// newline translation and echo first so the captured bytes arrive intact.
pub fn capture_script(shell: ShellType, markers: &CaptureMarkers) -> String {
    format!(
        "stty -onlcr -echo 2>/dev/null\n{}\n{}\n",
        shell::capture_function(shell, markers),
        CAPTURE_FUNCTION
    )
}

/// Split raw capture output into its sections.
///
/// Anything before the last start marker preceding the end marker is noise
/// (rc-file output, terminal setup) and is ignored, as is anything after the
/// end marker.
pub fn split_sections<'a>(output: &'a [u8], markers: &CaptureMarkers) -> Result<Vec<&'a [u8]>, StateError> {
    let start = markers.start();
    let section = markers.section();
    let end = markers.end();

    let end_pos = find(output, &end).ok_or(StateError::MissingEndMarker)?;
    let head = &output[..end_pos];
    let start_pos = rfind(head, &start).ok_or(StateError::MissingStartMarker)?;
    let mut body = &head[start_pos + start.len()..];

    let mut sections = Vec::with_capacity(SECTION_COUNT);
    while let Some(pos) = find(body, &section) {
        sections.push(&body[..pos]);
        body = &body[pos + section.len()..];
    }
    sections.push(body);

    if sections.len() != SECTION_COUNT {
        return Err(StateError::SectionCount {
            expected: SECTION_COUNT,
            found: sections.len(),
        });
    }
    Ok(sections)
}

/// Parse capture output into a [`ShellState`].
///
/// Values that are not valid UTF-8 cannot be carried in the model. They are
/// left out and named in [`ShellState::error`] rather than altered.
pub fn parse_capture(shell: ShellType, output: &[u8], markers: &CaptureMarkers) -> Result<ShellState, StateError> {
    let sections = split_sections(output, markers)?;
    let rules = shell::rules(shell);

    let version = utf8(sections[0], "version banner")?.trim().to_string();
    let family = VersionFamily::parse(&version)?;
    if family.shell != shell {
        return Err(StateError::VersionMismatch {
            base: shell.to_string(),
            target: version,
        });
    }

    let mut state = ShellState::new(version, utf8(sections[1], "working directory")?);
    let mut dropped = Dropped::default();

    let mut modules: Vec<String> = fields(sections[3])
        .into_iter()
        .filter(|m| !m.is_empty())
        .filter_map(|m| dropped.keep(m, || format!("module {}", String::from_utf8_lossy(m))))
        .collect();
    modules.sort();
    modules.dedup();
    state.modules = modules;

    for raw in fields(sections[4]) {
        let parsed = match std::str::from_utf8(raw) {
            Ok(record) if record.trim().is_empty() => continue,
            Ok(record) => parse_declaration(record),
            Err(_) => Err(non_utf8_declaration(raw)),
        };
        match parsed {
            Ok(entries) => {
                for (name, var) in entries {
                    if is_valid_name(&name) && !rules.is_excluded(&name) {
                        state.vars.insert(name, var);
                    }
                }
            }
            Err(StateError::NonUtf8(what)) => dropped.non_utf8.push(what),
            Err(e) => {
                debug!("skipping declaration: {}", e);
                dropped.unparseable += 1;
            }
        }
    }

    for entry in fields(sections[2]) {
        let Some(eq) = entry.iter().position(|b| *b == b'=') else {
            continue;
        };
        let Ok(name) = std::str::from_utf8(&entry[..eq]) else {
            continue;
        };
        if !is_valid_name(name) || rules.is_excluded(name) || state.vars.contains_key(name) {
            continue;
        }
        if let Some(value) = dropped.keep(&entry[eq + 1..], || format!("variable {}", name)) {
            state.vars.insert(name.to_string(), ShellVar::exported(value));
        }
    }

    for name in rules.unique_arrays {
        if let Some(var) = state.vars.get_mut(*name) {
            var.flags.unique = true;
        }
    }

    let alias_fields = fields(sections[5]);
    if alias_fields.len() % 3 != 0 {
        return Err(StateError::InvalidCapture(format!(
            "alias section has {} fields, expected triples",
            alias_fields.len()
        )));
    }
    for triple in alias_fields.chunks(3) {
        let kind: AliasKind = utf8(triple[0], "alias kind")?.parse()?;
        let Some(name) = dropped.keep(triple[1], || format!("alias {}", String::from_utf8_lossy(triple[1]))) else {
            continue;
        };
        if let Some(value) = dropped.keep(triple[2], || format!("alias {}", name)) {
            state.insert_alias(ShellAlias::new(kind, name, value));
        }
    }

    let func_fields = fields(sections[6]);
    if func_fields.len() % 2 != 0 {
        return Err(StateError::InvalidCapture(format!(
            "function section has {} fields, expected pairs",
            func_fields.len()
        )));
    }
    for pair in func_fields.chunks(2) {
        let Some(name) = dropped.keep(pair[0], || format!("function {}", String::from_utf8_lossy(pair[0]))) else {
            continue;
        };
        if shell::is_engine_name(&name) {
            continue;
        }
        let Some(body) = dropped.keep(pair[1], || format!("function {}", name)) else {
            continue;
        };
        let func = match body.as_str() {
            "autoload" => ShellFunc::Autoload,
            body => ShellFunc::Inline(body.strip_suffix('\n').unwrap_or(body).to_string()),
        };
        state.funcs.insert(name, func);
    }

    let hook_fields = fields(sections[7]);
    for pair in hook_fields.chunks(2) {
        let hook = String::from_utf8_lossy(pair[0]);
        let value = pair
            .get(1)
            .and_then(|v| dropped.keep(v, || format!("hook {}", hook)))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        match &*hook {
            "git_branch" => state.prompt.git_branch = value,
            "kube_context" => state.prompt.kube_context = value,
            other => debug!("ignoring unknown hook {:?}", other),
        }
    }

    // Display only; never replayed into a shell.
    state.prompt.rendered = String::from_utf8_lossy(sections[8]).into_owned();

    state.error = dropped.into_error();
    Ok(state)
}

/// Capture entries left out of the parsed state
#[derive(Debug, Default)]
struct Dropped {
    unparseable: usize,
    non_utf8: Vec<String>,
}

impl Dropped {
    /// Decode `bytes`, recording `what` when they are not UTF-8
    fn keep(&mut self, bytes: &[u8], what: impl FnOnce() -> String) -> Option<String> {
        match std::str::from_utf8(bytes) {
            Ok(text) => Some(text.to_string()),
            Err(_) => {
                self.non_utf8.push(what());
                None
            }
        }
    }

    fn into_error(mut self) -> Option<String> {
        let mut parts = Vec::new();
        if self.unparseable > 0 {
            parts.push(format!("skipped {} unparseable declarations", self.unparseable));
        }
        if !self.non_utf8.is_empty() {
            self.non_utf8.sort();
            self.non_utf8.dedup();
            parts.push(format!("dropped non-UTF-8 {}", self.non_utf8.join(", ")));
        }
        (!parts.is_empty()).then(|| parts.join("; "))
    }
}

/// Name the variables of a declaration whose raw bytes are not UTF-8
fn non_utf8_declaration(raw: &[u8]) -> StateError {
    match parse_declaration(&String::from_utf8_lossy(raw)) {
        Ok(entries) => StateError::NonUtf8(
            entries
                .iter()
                .map(|(name, _)| format!("variable {}", name))
                .collect::<Vec<_>>()
                .join(", "),
        ),
        Err(_) => StateError::InvalidCapture("declaration is not UTF-8".to_string()),
    }
}

fn utf8(bytes: &[u8], what: &str) -> Result<String, StateError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| StateError::NonUtf8(what.to_string()))
}

/// NUL-separated fields; a trailing NUL does not produce an empty field
fn fields(section: &[u8]) -> Vec<&[u8]> {
    if section.is_empty() {
        return Vec::new();
    }
    let section = section.strip_suffix(b"\0").unwrap_or(section);
    section.split(|b| *b == 0).collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VarValue;

    fn markers() -> CaptureMarkers {
        CaptureMarkers::from_tokens("aaaa1111", "bbbb2222")
    }

    fn build(markers: &CaptureMarkers, sections: &[&[u8]]) -> Vec<u8> {
        let mut out = markers.start();
        for (i, section) in sections.iter().enumerate() {
            if i > 0 {
                out.extend(markers.section());
            }
            out.extend_from_slice(section);
        }
        out.extend(markers.end());
        out
    }

    fn bash_sections() -> Vec<&'static [u8]> {
        vec![
            b"bash v5.2.15(1)-release",
            b"/home/me/src",
            b"EDITOR=vim\0LANG=C.UTF-8\0SHWIRE_RTNSTATE=/tmp/x\0PWD=/home/me/src\0bad-name=1\0",
            b"",
            b"declare -x EDITOR=\"nano\"\0declare -a list=([0]=\"a\" [1]=\"b\")\0declare -i BASHPID=\"77\"\0declare -- _shwire_name=\"x\"\0garbage here\0",
            b"regular\0ll\0ls -l\0regular\0empty\0\0",
            b"greet\0greet () \n{ \n    echo hi\n}\n\0_shwire_capture\0_shwire_capture () { :; }\0",
            b"git_branch\0main\0kube_context\0\0",
            b"me@host:~/src$ ",
        ]
    }

    #[test]
    fn test_parse_bash_capture() {
        let markers = markers();
        let mut output = b"motd noise\r\n".to_vec();
        output.extend(build(&markers, &bash_sections()));
        output.extend_from_slice(b"\r\nlogout\r\n");

        let state = parse_capture(ShellType::Bash, &output, &markers).unwrap();
        assert_eq!(state.version, "bash v5.2.15(1)-release");
        assert_eq!(state.cwd, "/home/me/src");

        // Declarations win over the environment copy.
        assert_eq!(state.vars["EDITOR"].value, VarValue::Scalar("nano".to_string()));
        assert!(state.vars["EDITOR"].flags.exported);
        assert_eq!(state.vars["LANG"], ShellVar::exported("C.UTF-8"));
        assert!(state.vars["list"].flags.array);

        for dropped in ["BASHPID", "_shwire_name", "SHWIRE_RTNSTATE", "PWD", "bad-name"] {
            assert!(!state.vars.contains_key(dropped), "{dropped} should be excluded");
        }

        assert_eq!(state.aliases["ll"].value, "ls -l");
        assert_eq!(state.aliases["empty"].value, "");
        assert_eq!(state.funcs.len(), 1);
        assert!(matches!(&state.funcs["greet"], ShellFunc::Inline(body) if body.ends_with('}')));

        assert_eq!(state.prompt.git_branch.as_deref(), Some("main"));
        assert_eq!(state.prompt.kube_context, None);
        assert_eq!(state.prompt.rendered, "me@host:~/src$ ");
        assert_eq!(state.error.as_deref(), Some("skipped 1 unparseable declarations"));
    }

    #[test]
    fn test_parse_zsh_capture() {
        let markers = markers();
        let sections: Vec<&[u8]> = vec![
            b"zsh v5.9",
            b"/",
            b"",
            b"zsh/zle\0zsh/complete\0zsh/zle\0",
            b"typeset -A options=( [autocd]=on )\0export -T PATH path=( /usr/bin /bin )\0typeset -i SECONDS=4\0",
            b"global\0G\0| grep\0suffix\0txt\0vim\0",
            b"compinit\0autoload\0",
            b"",
            b"% ",
        ];
        let state = parse_capture(ShellType::Zsh, &build(&markers, &sections), &markers).unwrap();

        assert_eq!(state.modules, vec!["zsh/complete".to_string(), "zsh/zle".to_string()]);
        assert!(state.vars.contains_key("options"));
        assert!(state.vars["path"].flags.unique);
        assert!(state.vars["PATH"].flags.tied);
        assert!(!state.vars.contains_key("SECONDS"));
        assert_eq!(state.aliases["global:G"].kind, AliasKind::Global);
        assert_eq!(state.aliases["suffix:txt"].value, "vim");
        assert_eq!(state.funcs["compinit"], ShellFunc::Autoload);
        assert_eq!(state.error, None);
    }

    #[test]
    fn test_non_utf8_entries_are_dropped_and_named() {
        let markers = markers();
        let sections: Vec<&[u8]> = vec![
            b"bash v5.2.15(1)-release",
            b"/",
            b"RAW_ENV=\xff\xfe\0GOOD_ENV=ok\0",
            b"",
            b"declare -- ESCAPED=$'\\xff'\0declare -x RAW=\"\xc3\x28\"\0declare -- FINE=\"caf\xc3\xa9\"\0",
            b"regular\0bin\0\xff\0",
            b"bad\0echo \xfe\n\0good\0echo ok\n\0",
            b"",
            b"$ ",
        ];
        let state = parse_capture(ShellType::Bash, &build(&markers, &sections), &markers).unwrap();

        assert_eq!(state.vars["FINE"].value, VarValue::Scalar("café".to_string()));
        assert_eq!(state.vars["GOOD_ENV"], ShellVar::exported("ok"));
        for name in ["ESCAPED", "RAW", "RAW_ENV"] {
            assert!(!state.vars.contains_key(name), "{name} should be dropped");
        }
        assert!(!state.aliases.contains_key("bin"));
        assert!(!state.funcs.contains_key("bad"));
        assert!(state.funcs.contains_key("good"));
        assert_eq!(
            state.error.as_deref(),
            Some("dropped non-UTF-8 alias bin, function bad, variable ESCAPED, variable RAW, variable RAW_ENV")
        );
    }

    #[test]
    fn test_non_utf8_cwd_fails_capture() {
        let markers = markers();
        let mut sections = bash_sections();
        sections[1] = b"/home/\xff";
        let err = parse_capture(ShellType::Bash, &build(&markers, &sections), &markers).unwrap_err();
        assert!(matches!(err, StateError::NonUtf8(what) if what == "working directory"));
    }

    #[test]
    fn test_wrong_section_count() {
        let markers = markers();
        let mut sections = bash_sections();
        sections.pop();
        let err = parse_capture(ShellType::Bash, &build(&markers, &sections), &markers).unwrap_err();
        assert!(matches!(err, StateError::SectionCount { expected: 9, found: 8 }));
    }

    #[test]
    fn test_missing_markers() {
        let markers = markers();
        let output = build(&markers, &bash_sections());

        let truncated = &output[..output.len() - 4];
        assert!(matches!(
            parse_capture(ShellType::Bash, truncated, &markers),
            Err(StateError::MissingEndMarker)
        ));

        let headless = &output[markers.start().len()..];
        assert!(matches!(
            parse_capture(ShellType::Bash, headless, &markers),
            Err(StateError::MissingStartMarker)
        ));

        let other = CaptureMarkers::from_tokens("cccc3333", "dddd4444");
        assert!(parse_capture(ShellType::Bash, &output, &other).is_err());
    }

    #[test]
    fn test_flavor_mismatch() {
        let markers = markers();
        let err = parse_capture(ShellType::Zsh, &build(&markers, &bash_sections()), &markers).unwrap_err();
        assert!(err.is_version_mismatch());
    }

    #[test]
    fn test_generated_markers_differ() {
        let a = CaptureMarkers::generate();
        let b = CaptureMarkers::generate();
        assert_ne!(a, b);
        assert_ne!(a.start(), a.section());
        assert_ne!(a.section(), a.end());
    }

    #[test]
    fn test_capture_script_prologue() {
        let script = capture_script(ShellType::Bash, &markers());
        assert!(script.starts_with("stty -onlcr -echo"));
        assert!(script.trim_end().ends_with(CAPTURE_FUNCTION));
    }
}
