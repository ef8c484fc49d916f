//! Wire protocol envelopes for the control channel.
//!
//! Every inbound frame is a [`RequestEnvelope`]: an opaque correlation `id`
//! chosen by the client plus an operation object tagged by `type`. The
//! server answers each request with exactly one [`ResponseEnvelope`]
//! carrying the same `id`. Server-initiated pushes (process output, file
//! changes) use [`EventEnvelope`] with a server-generated id that is not
//! correlated to any request.
//!
//! The operation is deserialised in two steps: the envelope keeps it as a
//! raw JSON value so that a response can always be produced with the
//! request id, even when the operation itself fails to parse. See
//! [`Operation::from_value`] for how parse failures are classified.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

/// An inbound request frame: `{id, operation}`.
///
/// The `id` is never interpreted by the server; it is echoed back verbatim
/// in the response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub id: String,
    pub operation: Value,
}

/// The operation union, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    #[serde(rename = "readFile")]
    ReadFile {
        path: String,
        #[serde(default)]
        encoding: Option<String>,
    },

    #[serde(rename = "writeFile")]
    WriteFile {
        path: String,
        /// Absent `content` is a handler-level error, not a parse error.
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        encoding: Option<String>,
    },

    #[serde(rename = "rm")]
    Rm {
        path: String,
        #[serde(default)]
        recursive: bool,
    },

    #[serde(rename = "readdir")]
    Readdir { path: String },

    #[serde(rename = "mkdir")]
    Mkdir {
        path: String,
        #[serde(default)]
        recursive: bool,
    },

    #[serde(rename = "stat")]
    Stat { path: String },

    #[serde(rename = "mount")]
    Mount {
        /// Root to mount under; defaults to the workspace root itself.
        #[serde(default)]
        path: Option<String>,
        /// Nested tree of file contents; see the filesystem crate for the
        /// accepted shape.
        #[serde(default)]
        content: Option<Value>,
    },

    #[serde(rename = "spawn")]
    Spawn {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },

    #[serde(rename = "input")]
    Input { pid: u32, data: String },

    #[serde(rename = "kill")]
    Kill { pid: u32 },

    #[serde(rename = "resize")]
    Resize { pid: u32, cols: u16, rows: u16 },

    #[serde(rename = "watch")]
    Watch {
        patterns: Vec<String>,
        #[serde(default)]
        persistent: Option<bool>,
    },

    #[serde(rename = "watch-paths")]
    WatchPaths { include: Vec<String> },

    #[serde(rename = "auth")]
    Auth { token: String },
}

/// The handler family an operation tag belongs to.
///
/// Used to classify malformed-but-recognised operations under the owning
/// family's error code instead of `INVALID_OPERATION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationFamily {
    Filesystem,
    Process,
    Watch,
    Auth,
}

impl OperationFamily {
    /// Look up the family for a `type` tag; `None` for unknown tags.
    pub fn of_tag(tag: &str) -> Option<Self> {
        match tag {
            "readFile" | "writeFile" | "rm" | "readdir" | "mkdir" | "stat" | "mount" => {
                Some(Self::Filesystem)
            }
            "spawn" | "input" | "kill" | "resize" => Some(Self::Process),
            "watch" | "watch-paths" => Some(Self::Watch),
            "auth" => Some(Self::Auth),
            _ => None,
        }
    }

    fn malformed(self, tag: &str, err: &serde_json::Error) -> AgentError {
        let message = format!("invalid '{}' operation: {}", tag, err);
        match self {
            Self::Filesystem => AgentError::filesystem(message),
            Self::Process => AgentError::process(message),
            Self::Watch => AgentError::watch(message),
            Self::Auth => AgentError::auth(message),
        }
    }
}

impl Operation {
    /// Deserialise an operation from its raw envelope value.
    ///
    /// Classification:
    /// - missing or unknown `type` tag → [`AgentError::InvalidOperation`],
    /// - known tag but malformed fields → the owning family's
    ///   operation-failed error.
    pub fn from_value(value: Value) -> Result<Self, AgentError> {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match serde_json::from_value::<Operation>(value) {
            Ok(op) => Ok(op),
            Err(err) => match tag {
                None => Err(AgentError::InvalidOperation(
                    "missing operation type".to_string(),
                )),
                Some(tag) => match OperationFamily::of_tag(&tag) {
                    Some(family) => Err(family.malformed(&tag, &err)),
                    None => Err(AgentError::InvalidOperation(tag)),
                },
            },
        }
    }
}

/// Error body carried in failed response envelopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// An outbound response frame: `{id, success, data?, error?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseEnvelope {
    /// A successful response carrying optional data.
    pub fn ok<S: Into<String>>(id: S, data: Option<Value>) -> Self {
        Self {
            id: id.into(),
            success: true,
            data,
            error: None,
        }
    }

    /// A failed response; code and message come from the error itself.
    pub fn failure<S: Into<String>>(id: S, err: &AgentError) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// A server-initiated push frame: `{id, event, data}`.
///
/// The id is generated by the server (see [`crate::token::new_token`]) and
/// carries no correlation meaning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    pub event: String,
    pub data: Value,
}

impl EventEnvelope {
    pub fn new<S: Into<String>>(event: S, data: Value) -> Self {
        Self {
            id: crate::token::new_token(),
            event: event.into(),
            data,
        }
    }
}
