pub mod paths;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a bridge session.
pub type SessionId = String;

/// Client-to-server requests sent as JSON-lines over the Unix socket.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    // Session management
    SessionCreate {
        exec: String,
        args: Vec<String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        /// Directory holding the wrapped tool's configuration file; exported
        /// to the subprocess as UPLINK_BASE_DIR.
        #[serde(default)]
        config_dir: Option<PathBuf>,
        #[serde(default)]
        label: Option<String>,
    },
    SessionCancel {
        session_id: SessionId,
    },
    SessionList,
    SessionInfo {
        session_id: SessionId,
    },

    // Prompt mediation
    PromptAwaiting {
        session_id: SessionId,
    },
    PromptSubmit {
        session_id: SessionId,
        prompt_id: u64,
        value: String,
    },

    // Event streaming
    Subscribe {
        session_id: SessionId,
    },

    // Dependency acquisition
    DepsResolve,
    DepsList,
}

/// Server-to-client responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
        code: ErrorCode,
    },
    Event(Event),
}

impl Response {
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Response::Ok { data }
    }
}

/// Events streamed to subscribers.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    SessionState {
        session_id: SessionId,
        state: SessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<String>,
    },
    /// Raw subprocess output, in arrival order per channel.
    Output {
        session_id: SessionId,
        seq: u64,
        channel: LogChannel,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    PromptReady {
        session_id: SessionId,
        descriptor: PromptDescriptor,
    },
    PromptResolved {
        session_id: SessionId,
        prompt_id: u64,
        cancelled: bool,
    },
    DepProgress {
        name: String,
        downloaded: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
    },
    DepResolved {
        resolved: ResolvedDependency,
    },
    DepFailed {
        name: String,
        error: String,
    },
}

/// Session lifecycle states.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    AwaitingResponse,
    Exiting,
    Exited,
    Failed,
}

/// Shape of a prompt detected in subprocess output.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    YesNo,
    Choice,
    FreeText,
    Secret,
}

/// A discrete request for operator input, produced by the prompt translator.
/// Immutable once emitted; ids are monotonic within a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PromptDescriptor {
    pub id: u64,
    pub kind: PromptKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    pub created_at_epoch_ms: u64,
}

/// An operator's answer to a prompt. Must reference the currently
/// outstanding descriptor's id; anything else is rejected as stale.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResponseEnvelope {
    pub prompt_id: u64,
    pub value: String,
}

/// Source channel of a log record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogChannel {
    Stdout,
    Stderr,
    Bridge,
}

/// One durable, append-only log line.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogRecord {
    pub session_id: SessionId,
    pub timestamp_ms: u64,
    pub channel: LogChannel,
    pub text: String,
}

/// Where a resolved binary came from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DependencyOrigin {
    Bundled,
    SystemPath,
    Downloaded,
}

/// Static description of one required external binary.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DependencySpec {
    pub name: String,
    #[serde(default)]
    pub required_version: Option<String>,
    /// Target triple this spec applies to.
    pub platform: String,
    /// Candidate download URLs, tried in order.
    pub source_urls: Vec<String>,
    /// Hex SHA-256 of the artifact as fetched, when published upstream.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// A verified, usable local binary path. Replaced atomically on
/// re-resolution, never mutated in place.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResolvedDependency {
    pub name: String,
    pub local_path: PathBuf,
    pub origin: DependencyOrigin,
    pub verified_at_epoch_ms: u64,
}

/// Summary info returned by session list/info commands.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BridgeSessionInfo {
    pub id: SessionId,
    pub label: Option<String>,
    pub exec: String,
    pub args: Vec<String>,
    pub state: SessionState,
    pub created_at_epoch_ms: u64,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionNotFound,
    SessionExited,
    InvalidRequest,
    PromptStale,
    NoPromptOutstanding,
    DependencyFailed,
    SpawnFailed,
    ServerError,
}

/// Base64 encoding for byte arrays in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
