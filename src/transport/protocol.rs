//! JSON frames exchanged with the collaboration server.
//!
//! Every frame is `{"event": <name>, "data": <object>}`. Outbound frames are
//! strongly typed; inbound frames are decoded leniently into [`RemoteEvent`]
//! so that a missing field degrades to `None` rather than a parse failure.

use crate::error::{SyncError, SyncResult};
use crate::sync::store::SessionId;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONNECTION_ESTABLISHED: &str = "connection_established";
pub const CONNECTION_LOST: &str = "connection_lost";
pub const RECONNECTING: &str = "reconnecting";

/// Inbound event names the coordinator subscribes to.
pub const INBOUND_EVENTS: &[&str] = &[
    "terminal_created",
    "terminal_renamed",
    "terminal_closed",
    "remote_variable_update",
    "playbook_changed",
    "notes_changed",
    "global_notes_changed",
    "editing_lock_response",
    "editing_unlock_response",
    "resource_lock_changed",
    "clients_updated",
    "terminal_presence_update",
    CONNECTION_ESTABLISHED,
    CONNECTION_LOST,
    RECONNECTING,
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn decode(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableAction {
    Create,
    Update,
    Delete,
}

impl VariableAction {
    pub fn parse(raw: &str) -> SyncResult<Self> {
        match raw {
            "create" => Ok(VariableAction::Create),
            "update" => Ok(VariableAction::Update),
            "delete" => Ok(VariableAction::Delete),
            other => Err(SyncError::UnknownAction {
                kind: "variable",
                action: other.to_string(),
            }),
        }
    }

    pub fn past_tense(self) -> &'static str {
        match self {
            VariableAction::Create => "created",
            VariableAction::Update => "updated",
            VariableAction::Delete => "deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybookAction {
    Load,
    Update,
    Close,
}

impl PlaybookAction {
    pub fn parse(raw: &str) -> SyncResult<Self> {
        match raw {
            "load" => Ok(PlaybookAction::Load),
            "update" => Ok(PlaybookAction::Update),
            "close" => Ok(PlaybookAction::Close),
            other => Err(SyncError::UnknownAction {
                kind: "playbook",
                action: other.to_string(),
            }),
        }
    }

    pub fn past_tense(self) -> &'static str {
        match self {
            PlaybookAction::Load => "loaded",
            PlaybookAction::Update => "updated",
            PlaybookAction::Close => "closed",
        }
    }
}

/// Messages this client sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    TerminalCreated {
        terminal_id: SessionId,
        port: u16,
        name: String,
    },
    TerminalRenamed {
        terminal_id: SessionId,
        port: u16,
        name: String,
    },
    TerminalClosed {
        terminal_id: SessionId,
        port: u16,
    },
    VariableUpdated {
        terminal_id: SessionId,
        name: String,
        value: Option<String>,
        action: VariableAction,
    },
    PlaybookUpdated {
        terminal_id: SessionId,
        name: String,
        action: PlaybookAction,
    },
    NotesUpdated {
        terminal_id: Option<SessionId>,
        content: String,
    },
    EditingStarted {
        resource_id: String,
    },
    EditingStopped {
        resource_id: String,
    },
    JoinTerminal {
        terminal_id: SessionId,
    },
    LeaveTerminal {
        terminal_id: SessionId,
    },
}

impl OutboundMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundMessage::TerminalCreated { .. } => "terminal_created",
            OutboundMessage::TerminalRenamed { .. } => "terminal_renamed",
            OutboundMessage::TerminalClosed { .. } => "terminal_closed",
            OutboundMessage::VariableUpdated { .. } => "variable_updated",
            OutboundMessage::PlaybookUpdated { .. } => "playbook_updated",
            OutboundMessage::NotesUpdated { .. } => "notes_updated",
            OutboundMessage::EditingStarted { .. } => "editing_started",
            OutboundMessage::EditingStopped { .. } => "editing_stopped",
            OutboundMessage::JoinTerminal { .. } => "join_terminal",
            OutboundMessage::LeaveTerminal { .. } => "leave_terminal",
        }
    }

    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Accepts a string or a number and yields its string form.
pub(crate) fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(de::Error::custom(format!("expected string, got {}", other))),
    }
}

fn lenient_session<'de, D>(deserializer: D) -> Result<Option<SessionId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_string(deserializer)?.and_then(|raw| SessionId::from_wire(&raw)))
}

pub(crate) fn lenient_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_string(deserializer)?.and_then(|raw| raw.trim().parse::<u16>().ok()))
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TerminalPayload {
    #[serde(default, deserialize_with = "lenient_session")]
    pub terminal_id: Option<SessionId>,
    #[serde(default, deserialize_with = "lenient_port")]
    pub port: Option<u16>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
}

impl TerminalPayload {
    /// The session key: `terminal_id` when present, else derived from `port`.
    pub fn session_id(&self) -> Option<SessionId> {
        self.terminal_id
            .clone()
            .or_else(|| self.port.map(SessionId::from_port))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VariablePayload {
    #[serde(default, deserialize_with = "lenient_session")]
    pub terminal_id: Option<SessionId>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub value: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub action: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PlaybookPayload {
    #[serde(default, deserialize_with = "lenient_session")]
    pub terminal_id: Option<SessionId>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub action: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotesPayload {
    #[serde(default, deserialize_with = "lenient_session")]
    pub terminal_id: Option<SessionId>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LockHolderInfo {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LockResponsePayload {
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub lock_info: Option<LockHolderInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct LockChangedPayload {
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub locked: Option<bool>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClientInfo {
    #[serde(default, alias = "id")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "lenient_session")]
    pub active_terminal: Option<SessionId>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ClientsPayload {
    #[serde(default)]
    pub clients: Vec<ClientInfo>,
    #[serde(default)]
    pub count: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PresencePayload {
    #[serde(default, deserialize_with = "lenient_session")]
    pub terminal_id: Option<SessionId>,
    #[serde(default)]
    pub clients: Vec<ClientInfo>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ReconnectingPayload {
    #[serde(default)]
    pub attempt: u32,
}

/// Typed view of an inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    TerminalCreated(TerminalPayload),
    TerminalRenamed(TerminalPayload),
    TerminalClosed(TerminalPayload),
    VariableChanged(VariablePayload),
    PlaybookChanged(PlaybookPayload),
    NotesChanged(NotesPayload),
    GlobalNotesChanged(NotesPayload),
    EditingLockResponse(LockResponsePayload),
    EditingUnlockResponse(LockResponsePayload),
    ResourceLockChanged(LockChangedPayload),
    ClientsUpdated(ClientsPayload),
    TerminalPresence(PresencePayload),
    ConnectionEstablished(Value),
    ConnectionLost(Value),
    Reconnecting(ReconnectingPayload),
}

impl RemoteEvent {
    /// Decodes a named event. Unknown names yield `Ok(None)`; payloads whose
    /// fields have the wrong shape yield `MalformedPayload`.
    pub fn from_parts(event: &str, data: &Value) -> SyncResult<Option<Self>> {
        fn typed<T: for<'de> Deserialize<'de> + Default>(event: &str, data: &Value) -> SyncResult<T> {
            if data.is_null() {
                return Ok(T::default());
            }
            T::deserialize(data).map_err(|e| SyncError::malformed(event, e.to_string()))
        }

        let decoded = match event {
            "terminal_created" => RemoteEvent::TerminalCreated(typed(event, data)?),
            "terminal_renamed" => RemoteEvent::TerminalRenamed(typed(event, data)?),
            "terminal_closed" => RemoteEvent::TerminalClosed(typed(event, data)?),
            // The server relays room-scoped updates as `variable_changed`.
            "remote_variable_update" | "variable_changed" => {
                RemoteEvent::VariableChanged(typed(event, data)?)
            }
            "playbook_changed" => RemoteEvent::PlaybookChanged(typed(event, data)?),
            "notes_changed" => RemoteEvent::NotesChanged(typed(event, data)?),
            "global_notes_changed" => RemoteEvent::GlobalNotesChanged(typed(event, data)?),
            "editing_lock_response" => RemoteEvent::EditingLockResponse(typed(event, data)?),
            "editing_unlock_response" => RemoteEvent::EditingUnlockResponse(typed(event, data)?),
            "resource_lock_changed" => RemoteEvent::ResourceLockChanged(typed(event, data)?),
            "clients_updated" => RemoteEvent::ClientsUpdated(typed(event, data)?),
            "terminal_presence_update" => RemoteEvent::TerminalPresence(typed(event, data)?),
            CONNECTION_ESTABLISHED => RemoteEvent::ConnectionEstablished(data.clone()),
            CONNECTION_LOST => RemoteEvent::ConnectionLost(data.clone()),
            RECONNECTING => RemoteEvent::Reconnecting(typed(event, data)?),
            _ => return Ok(None),
        };
        Ok(Some(decoded))
    }

    pub fn name(&self) -> &'static str {
        match self {
            RemoteEvent::TerminalCreated(_) => "terminal_created",
            RemoteEvent::TerminalRenamed(_) => "terminal_renamed",
            RemoteEvent::TerminalClosed(_) => "terminal_closed",
            RemoteEvent::VariableChanged(_) => "remote_variable_update",
            RemoteEvent::PlaybookChanged(_) => "playbook_changed",
            RemoteEvent::NotesChanged(_) => "notes_changed",
            RemoteEvent::GlobalNotesChanged(_) => "global_notes_changed",
            RemoteEvent::EditingLockResponse(_) => "editing_lock_response",
            RemoteEvent::EditingUnlockResponse(_) => "editing_unlock_response",
            RemoteEvent::ResourceLockChanged(_) => "resource_lock_changed",
            RemoteEvent::ClientsUpdated(_) => "clients_updated",
            RemoteEvent::TerminalPresence(_) => "terminal_presence_update",
            RemoteEvent::ConnectionEstablished(_) => CONNECTION_ESTABLISHED,
            RemoteEvent::ConnectionLost(_) => CONNECTION_LOST,
            RemoteEvent::Reconnecting(_) => RECONNECTING,
        }
    }
}
