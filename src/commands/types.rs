//! Command wire types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::path;
use crate::{Error, Result};

/// Closed vocabulary of commands a device understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Reload the tool catalog
    RefreshTools,
    /// Stop serving the device; payload carries the reason
    BlockDevice,
    /// Resume serving the device; payload carries the reason
    UnblockDevice,
    /// Restart the client application
    RestartApp,
    /// Regenerate cached tool icons
    UpdateIcons,
}

impl CommandKind {
    /// Every known kind
    pub const ALL: [Self; 5] = [
        Self::RefreshTools,
        Self::BlockDevice,
        Self::UnblockDevice,
        Self::RestartApp,
        Self::UpdateIcons,
    ];

    /// Wire name of the kind
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RefreshTools => "refresh_tools",
            Self::BlockDevice => "block_device",
            Self::UnblockDevice => "unblock_device",
            Self::RestartApp => "restart_app",
            Self::UpdateIcons => "update_icons",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::UnknownCommand(s.to_string()))
    }
}

/// Who a command is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// A single device by id
    Device(String),
    /// Every device, through the broadcast slot
    All,
}

impl Target {
    /// Parse an admin-supplied target, where `"all"` means broadcast
    ///
    /// # Errors
    ///
    /// Returns error if the device id is not a valid store key
    pub fn parse(raw: &str) -> Result<Self> {
        if raw == path::ALL_DEVICES {
            return Ok(Self::All);
        }
        path::validate_device_id(raw)?;
        Ok(Self::Device(raw.to_string()))
    }

    /// Wire value of `targetDeviceId`
    #[must_use]
    pub fn as_wire(&self) -> &str {
        match self {
            Self::Device(id) => id,
            Self::All => path::ALL_DEVICES,
        }
    }

    /// Store path of the slot this target reads from
    #[must_use]
    pub fn slot(&self) -> String {
        match self {
            Self::Device(id) => path::targeted(id),
            Self::All => path::BROADCAST.to_string(),
        }
    }
}

/// Raw command record as stored in a slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device_id: Option<String>,
    pub timestamp: i64,
}

/// A decoded command
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCommand {
    pub kind: CommandKind,
    pub payload: Value,
    pub target: Target,
    /// Issue time in milliseconds since epoch
    pub issued_at: i64,
}

impl IssuedCommand {
    /// Build the stored record for this command
    #[must_use]
    pub fn to_envelope(&self) -> CommandEnvelope {
        CommandEnvelope {
            kind: self.kind.as_str().to_string(),
            data: self.payload.clone(),
            target_device_id: Some(self.target.as_wire().to_string()),
            timestamp: self.issued_at,
        }
    }

    /// Decode a stored envelope
    ///
    /// A missing `targetDeviceId` falls back to `default_target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownCommand`] for a type outside the vocabulary
    pub fn from_envelope(envelope: CommandEnvelope, default_target: &Target) -> Result<Self> {
        let kind = envelope.kind.parse()?;
        let target = match envelope.target_device_id.as_deref() {
            None => default_target.clone(),
            Some(path::ALL_DEVICES) => Target::All,
            Some(id) => Target::Device(id.to_string()),
        };
        Ok(Self {
            kind,
            payload: envelope.data,
            target,
            issued_at: envelope.timestamp,
        })
    }

    /// Key identifying this command for deduplication
    #[must_use]
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.kind, self.issued_at)
    }

    /// Payload as text, for block and unblock reasons
    #[must_use]
    pub fn payload_text(&self) -> Option<&str> {
        self.payload.as_str()
    }
}

/// Outcome recorded in a command response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Executed,
    Failed,
}

/// Audit record appended after a device handles a command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub device_id: String,
    pub command_type: CommandKind,
    pub status: ResponseStatus,
    pub timestamp: i64,
    pub response: String,
}

impl CommandResponse {
    /// Response for a command that ran to completion
    #[must_use]
    pub fn executed(device_id: &str, kind: CommandKind) -> Self {
        Self {
            device_id: device_id.to_string(),
            command_type: kind,
            status: ResponseStatus::Executed,
            timestamp: chrono::Utc::now().timestamp_millis(),
            response: "Command executed successfully".to_string(),
        }
    }

    /// Response for a command whose handler returned an error
    #[must_use]
    pub fn failed(device_id: &str, kind: CommandKind, error: &Error) -> Self {
        Self {
            device_id: device_id.to_string(),
            command_type: kind,
            status: ResponseStatus::Failed,
            timestamp: chrono::Utc::now().timestamp_millis(),
            response: error.to_string(),
        }
    }
}
