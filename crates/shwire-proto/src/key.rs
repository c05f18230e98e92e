//! Command keys

use crate::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifies one command's lifetime: `(group id, command id)`.
///
/// The string form is `"<group>/<cmd>"` with both halves UUIDs; that is also
/// how keys travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommandKey {
    group_id: Uuid,
    cmd_id: Uuid,
}

impl CommandKey {
    /// Key from its two halves
    pub fn new(group_id: Uuid, cmd_id: Uuid) -> Self {
        Self { group_id, cmd_id }
    }

    /// Fresh command id within a group
    pub fn generate(group_id: Uuid) -> Self {
        Self::new(group_id, Uuid::new_v4())
    }

    /// Parse a key from its two string halves
    pub fn join(group: &str, cmd: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidCommandKey(format!("{}/{}", group, cmd));
        let group_id = Uuid::parse_str(group).map_err(|_| invalid())?;
        let cmd_id = Uuid::parse_str(cmd).map_err(|_| invalid())?;
        Ok(Self::new(group_id, cmd_id))
    }

    /// The two string halves
    pub fn split(&self) -> (String, String) {
        (self.group_id.to_string(), self.cmd_id.to_string())
    }

    /// Group (screen/session) id
    pub fn group_id(&self) -> Uuid {
        self.group_id
    }

    /// Command id
    pub fn cmd_id(&self) -> Uuid {
        self.cmd_id
    }
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_id, self.cmd_id)
    }
}

impl FromStr for CommandKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((group, cmd)) if !group.is_empty() && !cmd.is_empty() => Self::join(group, cmd),
            _ => Err(ProtocolError::InvalidCommandKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for CommandKey {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CommandKey> for String {
    fn from(key: CommandKey) -> Self {
        key.to_string()
    }
}
