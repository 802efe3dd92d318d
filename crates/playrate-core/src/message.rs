//! Wire messages exchanged between the coordinator and page agents.
//!
//! Every one-shot message is a JSON object tagged by `action`; every reply is
//! a [`Reply`]. Unknown actions decode to an `Unknown` variant instead of
//! failing, so a newer coordinator never crashes an older agent.

use serde::{Deserialize, Serialize};

pub const INVALID_SPEED: &str = "Invalid speed value";
pub const UNKNOWN_ACTION: &str = "Unknown action";

/// Coordinator → agent commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Command {
    Ping,
    /// The raw payload is validated by the handler, never by the decoder.
    SetSpeed {
        #[serde(default)]
        speed: serde_json::Value,
    },
    #[serde(alias = "getCurrentSpeed")]
    GetSpeed,
    #[serde(alias = "showSpeedInput", alias = "toggleSpeedPopup")]
    ToggleSpeedInput,
    Cleanup,
    InitializeCheck,
    #[serde(other)]
    Unknown,
}

impl Command {
    #[must_use]
    pub fn set_speed(speed: f64) -> Self {
        Self::SetSpeed {
            speed: serde_json::Value::from(speed),
        }
    }

    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::SetSpeed { .. } => "setSpeed",
            Self::GetSpeed => "getSpeed",
            Self::ToggleSpeedInput => "toggleSpeedInput",
            Self::Cleanup => "cleanup",
            Self::InitializeCheck => "initializeCheck",
            Self::Unknown => "unknown",
        }
    }
}

/// Agent → coordinator requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum AgentRequest {
    Ping,
    ReloadContentScript,
    SetSpeed {
        #[serde(default)]
        speed: serde_json::Value,
    },
    GetSpeed,
    #[serde(other)]
    Unknown,
}

impl AgentRequest {
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::ReloadContentScript => "reloadContentScript",
            Self::SetSpeed { .. } => "setSpeed",
            Self::GetSpeed => "getSpeed",
            Self::Unknown => "unknown",
        }
    }
}

/// Response to any one-shot message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_speed(success: bool, speed: f64) -> Self {
        Self {
            success,
            speed: Some(speed),
            error: None,
        }
    }

    #[must_use]
    pub fn status(success: bool) -> Self {
        Self {
            success,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            speed: None,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn invalid_speed() -> Self {
        Self::failure(INVALID_SPEED)
    }

    #[must_use]
    pub fn unknown_action() -> Self {
        Self::failure(UNKNOWN_ACTION)
    }
}

/// Messages carried by a long-lived channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WirePort", try_from = "WirePort")]
pub enum PortMessage {
    Ping,
    Pong { success: bool },
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WirePort {
    Action { action: String },
    Reply { success: bool },
}

impl From<PortMessage> for WirePort {
    fn from(message: PortMessage) -> Self {
        match message {
            PortMessage::Ping => Self::Action {
                action: "ping".to_string(),
            },
            PortMessage::Pong { success } => Self::Reply { success },
        }
    }
}

impl TryFrom<WirePort> for PortMessage {
    type Error = String;

    fn try_from(wire: WirePort) -> Result<Self, Self::Error> {
        match wire {
            WirePort::Action { action } if action == "ping" => Ok(Self::Ping),
            WirePort::Action { action } => Err(format!("unsupported port action {action:?}")),
            WirePort::Reply { success } => Ok(Self::Pong { success }),
        }
    }
}
