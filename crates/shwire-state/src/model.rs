//! Shell state model and hashing

use crate::StateError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Supported shell flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellType {
    /// GNU bash
    Bash,
    /// Z shell
    Zsh,
}

impl ShellType {
    /// All supported flavors
    pub const ALL: [ShellType; 2] = [ShellType::Bash, ShellType::Zsh];

    /// Lowercase flavor name, as used in version banners
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bash => "bash",
            Self::Zsh => "zsh",
        }
    }
}

impl fmt::Display for ShellType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShellType {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bash" => Ok(Self::Bash),
            "zsh" => Ok(Self::Zsh),
            other => Err(StateError::InvalidVersion(other.to_string())),
        }
    }
}

/// Flavor plus major version; states are only diffable within one family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionFamily {
    /// Shell flavor
    pub shell: ShellType,
    /// Major version number
    pub major: u32,
}

impl VersionFamily {
    /// Parse a version banner such as `bash v5.2.15(1)-release` or `zsh v5.9`
    pub fn parse(version: &str) -> Result<Self, StateError> {
        let invalid = || StateError::InvalidVersion(version.to_string());
        let mut words = version.split_whitespace();
        let shell: ShellType = words.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())?;
        let number = words.next().and_then(|w| w.strip_prefix('v')).ok_or_else(invalid)?;
        let major = number
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .filter(|digits| !digits.is_empty())
            .ok_or_else(invalid)?
            .parse()
            .map_err(|_| invalid())?;
        Ok(Self { shell, major })
    }
}

impl fmt::Display for VersionFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.shell, self.major)
    }
}

/// Attributes of a shell variable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarFlags {
    /// Exported to the environment
    pub exported: bool,
    /// Indexed array
    pub array: bool,
    /// Associative array
    pub assoc: bool,
    /// Read-only
    pub readonly: bool,
    /// Integer attribute
    pub integer: bool,
    /// Part of a tied scalar/array pair (zsh)
    pub tied: bool,
    /// Array elements kept unique (zsh `typeset -U`)
    pub unique: bool,
    /// Name reference (bash `declare -n`)
    pub nameref: bool,
}

impl VarFlags {
    /// Flags for a plain exported scalar
    pub fn exported() -> Self {
        Self {
            exported: true,
            ..Self::default()
        }
    }

    /// Apply the option letters of a `declare`/`typeset` flag word such as `-axr`
    pub fn apply_flag_word(&mut self, word: &str) {
        let Some(letters) = word.strip_prefix('-') else {
            return;
        };
        for c in letters.chars() {
            match c {
                'a' => self.array = true,
                'A' => self.assoc = true,
                'x' => self.exported = true,
                'r' => self.readonly = true,
                'i' => self.integer = true,
                'T' => self.tied = true,
                'U' => self.unique = true,
                'n' => self.nameref = true,
                _ => {}
            }
        }
    }
}

/// Value of a shell variable, unquoted
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarValue {
    /// Declared but never assigned
    Unset,
    /// Scalar string
    Scalar(String),
    /// Indexed array elements in order
    Array(Vec<String>),
    /// Associative array
    Assoc(BTreeMap<String, String>),
}

impl VarValue {
    /// Scalar text, if this is a scalar
    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Self::Scalar(s) => Some(s),
            _ => None,
        }
    }
}

/// One shell variable: value, attributes and optional tie partner
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShellVar {
    /// Attributes
    pub flags: VarFlags,
    /// Value
    pub value: VarValue,
    /// Name of the tied partner (zsh `typeset -T`)
    pub tied_to: Option<String>,
}

impl ShellVar {
    /// Unexported scalar
    pub fn scalar(value: impl Into<String>) -> Self {
        Self {
            flags: VarFlags::default(),
            value: VarValue::Scalar(value.into()),
            tied_to: None,
        }
    }

    /// Exported scalar
    pub fn exported(value: impl Into<String>) -> Self {
        Self {
            flags: VarFlags::exported(),
            value: VarValue::Scalar(value.into()),
            tied_to: None,
        }
    }

    /// Indexed array
    pub fn array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            flags: VarFlags {
                array: true,
                ..VarFlags::default()
            },
            value: VarValue::Array(items.into_iter().map(Into::into).collect()),
            tied_to: None,
        }
    }
}

/// Alias categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AliasKind {
    /// Command-position alias
    Regular,
    /// zsh global alias (`alias -g`)
    Global,
    /// zsh suffix alias (`alias -s`)
    Suffix,
}

impl AliasKind {
    /// Tag used in capture output
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Global => "global",
            Self::Suffix => "suffix",
        }
    }
}

impl FromStr for AliasKind {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(Self::Regular),
            "global" => Ok(Self::Global),
            "suffix" => Ok(Self::Suffix),
            other => Err(StateError::InvalidCapture(format!("unknown alias kind {:?}", other))),
        }
    }
}

/// One alias
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShellAlias {
    /// Category
    pub kind: AliasKind,
    /// Alias name
    pub name: String,
    /// Replacement text
    pub value: String,
}

impl ShellAlias {
    /// Create an alias
    pub fn new(kind: AliasKind, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            value: value.into(),
        }
    }

    /// Key under which the alias is stored in [`ShellState::aliases`].
    ///
    /// Regular aliases use their bare name; other categories are prefixed so
    /// the same name may exist once per category.
    pub fn map_key(&self) -> String {
        match self.kind {
            AliasKind::Regular => self.name.clone(),
            kind => format!("{}:{}", kind.as_str(), self.name),
        }
    }
}

/// A function definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShellFunc {
    /// Full definition text as printed by the shell
    Inline(String),
    /// Resolved lazily from the function search path
    Autoload,
}

/// Rendered prompt and ecosystem hooks; volatile and excluded from the hash
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromptInfo {
    /// Prompt string after expansion
    pub rendered: String,
    /// Current git branch, if inside a repository
    pub git_branch: Option<String>,
    /// Current kubernetes context, if configured
    pub kube_context: Option<String>,
}

/// Snapshot of an interactive shell's environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellState {
    /// Version banner, e.g. `bash v5.2.15(1)-release`
    pub version: String,
    /// Working directory
    pub cwd: String,
    /// Loaded modules (zsh)
    pub modules: Vec<String>,
    /// Variables by name
    pub vars: BTreeMap<String, ShellVar>,
    /// Aliases by [`ShellAlias::map_key`]
    pub aliases: BTreeMap<String, ShellAlias>,
    /// Functions by name
    pub funcs: BTreeMap<String, ShellFunc>,
    /// Prompt information
    pub prompt: PromptInfo,
    /// Non-fatal problem noticed while capturing
    pub error: Option<String>,
}

/// Hashed subset of a state: everything except volatile fields
#[derive(Serialize)]
struct CanonicalState<'a> {
    version: &'a str,
    cwd: &'a str,
    modules: &'a [String],
    vars: &'a BTreeMap<String, ShellVar>,
    aliases: &'a BTreeMap<String, ShellAlias>,
    funcs: &'a BTreeMap<String, ShellFunc>,
}

impl ShellState {
    /// Empty state for a version banner and working directory
    pub fn new(version: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    /// Version family of this state
    pub fn version_family(&self) -> Result<VersionFamily, StateError> {
        VersionFamily::parse(&self.version)
    }

    /// Shell flavor of this state
    pub fn shell_type(&self) -> Result<ShellType, StateError> {
        Ok(self.version_family()?.shell)
    }

    /// Fail unless `other` belongs to the same version family
    pub fn ensure_same_family(&self, other: &ShellState) -> Result<(), StateError> {
        let mismatch = || StateError::VersionMismatch {
            base: self.version.clone(),
            target: other.version.clone(),
        };
        let ours = self.version_family().map_err(|_| mismatch())?;
        let theirs = other.version_family().map_err(|_| mismatch())?;
        if ours != theirs {
            return Err(mismatch());
        }
        Ok(())
    }

    /// Stable content hash: lowercase hex SHA-256 over the canonical encoding
    pub fn hash(&self) -> Result<String, StateError> {
        let canonical = CanonicalState {
            version: &self.version,
            cwd: &self.cwd,
            modules: &self.modules,
            vars: &self.vars,
            aliases: &self.aliases,
            funcs: &self.funcs,
        };
        let encoded = rmp_serde::to_vec_named(&canonical)
            .map_err(|e| StateError::Encoding(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Insert an alias under its map key
    pub fn insert_alias(&mut self, alias: ShellAlias) {
        self.aliases.insert(alias.map_key(), alias);
    }
}
