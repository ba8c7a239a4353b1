//! Wire protocol between application workers and the helper.
//!
//! Wire format:
//! - Header: `[4B marker "dds\0"][4B payload_len_le]`
//! - Payload: JSON `{"command": "<name>", "args": {...}}`
//!
//! Requests and responses share the framing; each request gets exactly one
//! response.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use warden_core::{EngineSettings, TelemetrySettings};

pub const MARKER: &[u8; 4] = b"dds\0";

/// Header size: 4 bytes marker + 4 bytes payload length.
pub const HEADER_LEN: usize = 8;

/// Maximum payload: 4 MB.
pub const MAX_PAYLOAD_LEN: u32 = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad frame marker {0:02x?}")]
    BadMarker([u8; 4]),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(u32),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unexpected {command} in state {state}")]
    UnexpectedCommand {
        command: &'static str,
        state: &'static str,
    },
    #[error("client disconnected")]
    Disconnected,
    #[error(transparent)]
    Io(io::Error),
}

impl ProtocolError {
    /// True for a peer going away or a read timing out, as opposed to a
    /// misbehaving peer.
    #[must_use]
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut => Self::Disconnected,
            _ => Self::Io(e),
        }
    }
}

// ─── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum Command {
    ClientInit(ClientInitArgs),
    RequestInit(RequestInitArgs),
    RequestExec(RequestExecArgs),
    RequestShutdown(RequestShutdownArgs),
    ConfigSync(ConfigSyncArgs),
}

impl Command {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ClientInit(_) => "client_init",
            Self::RequestInit(_) => "request_init",
            Self::RequestExec(_) => "request_exec",
            Self::RequestShutdown(_) => "request_shutdown",
            Self::ConfigSync(_) => "config_sync",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInitArgs {
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub client_version: String,
    #[serde(default)]
    pub runtime_version: String,
    /// Forces requests on or off; absent defers to remote activation.
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub engine_settings: EngineSettings,
    #[serde(default)]
    pub remote_config_settings: RemoteConfigArgs,
    #[serde(default)]
    pub telemetry_settings: TelemetrySettings,
    #[serde(default)]
    pub runtime_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfigArgs {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestInitArgs {
    #[serde(default = "empty_map")]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestExecArgs {
    #[serde(default = "empty_map")]
    pub data: Value,
    #[serde(default)]
    pub rasp_rule: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestShutdownArgs {
    #[serde(default = "empty_map")]
    pub data: Value,
    #[serde(default)]
    pub api_sec_samp_key: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSyncArgs {
    #[serde(default)]
    pub rem_cfg_path: String,
    #[serde(default)]
    pub telemetry_settings: TelemetrySettings,
}

fn empty_map() -> Value {
    Value::Object(serde_json::Map::new())
}

// ─── Responses ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum Response {
    ClientInit(ClientInitResponse),
    RequestInit(Verdict),
    RequestExec(Verdict),
    RequestShutdown(Verdict),
    ConfigFeatures { enabled: bool },
    ConfigSync {},
    Error {},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStatus {
    Ok,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInitResponse {
    pub status: InitStatus,
    pub version: String,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Ok,
    Record,
    Block,
    Redirect,
    StackTrace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictAction {
    pub verdict: VerdictKind,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub actions: Vec<VerdictAction>,
    #[serde(default)]
    pub triggers: Vec<Value>,
    #[serde(default)]
    pub force_keep: bool,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

impl Verdict {
    #[must_use]
    pub fn verdicts(&self) -> Vec<VerdictKind> {
        self.actions.iter().map(|a| a.verdict).collect()
    }
}

// ─── Framing ─────────────────────────────────────────────────────────────────

/// Encode one framed message.
///
/// # Errors
///
/// Returns an error if serialization fails or the payload exceeds the limit.
pub fn encode<T: Serialize>(msg: &T) -> Result<BytesMut, ProtocolError> {
    let payload = serde_json::to_vec(msg)?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_LEN)
        .ok_or(ProtocolError::FrameTooLarge(u32::MAX))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(MARKER);
    buf.put_u32_le(len);
    buf.put_slice(&payload);
    Ok(buf)
}

/// Write one framed message.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub fn write_frame<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<(), ProtocolError> {
    let buf = encode(msg)?;
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

/// Read one framed message.
///
/// # Errors
///
/// Returns [`ProtocolError::Disconnected`] on EOF or timeout, and a framing
/// or decoding error for anything malformed.
pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header)?;

    let mut hdr = &header[..];
    let mut marker = [0u8; 4];
    hdr.copy_to_slice(&mut marker);
    if &marker != MARKER {
        return Err(ProtocolError::BadMarker(marker));
    }
    let len = hdr.get_u32_le();
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}
