//! Advisory editing locks and the presence roster.
//!
//! The tracker only requests and releases; the server decides who holds a
//! resource. A denial never blocks local editing, it is reported so the UI
//! can tell the user someone else is typing.

use crate::error::SyncError;
use crate::sync::store::SessionId;
use crate::transport::protocol::{
    ClientInfo, ClientsPayload, LockChangedPayload, LockResponsePayload, PresencePayload,
};
use crate::transport::{OutboundMessage, Transport};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    GlobalNotes,
    SessionNotes(SessionId),
    Playbook(String),
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::GlobalNotes => f.write_str("notes:global"),
            ResourceKey::SessionNotes(id) => write!(f, "notes:{}", id),
            ResourceKey::Playbook(name) => write!(f, "playbook:{}", name),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SyncError::InvalidResourceKey(s.to_string());
        let (namespace, rest) = s.split_once(':').ok_or_else(invalid)?;
        if rest.is_empty() {
            return Err(invalid());
        }
        match namespace {
            "notes" if rest == "global" => Ok(ResourceKey::GlobalNotes),
            "notes" => SessionId::from_wire(rest)
                .map(ResourceKey::SessionNotes)
                .ok_or_else(invalid),
            "playbook" => Ok(ResourceKey::Playbook(rest.to_string())),
            _ => Err(invalid()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockHolder {
    pub client_id: Option<String>,
    pub username: Option<String>,
}

impl LockHolder {
    pub fn display_name(&self) -> &str {
        self.username
            .as_deref()
            .or(self.client_id.as_deref())
            .unwrap_or("another user")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Idle,
    Pending,
    Held,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted(ResourceKey),
    Denied {
        resource: ResourceKey,
        holder: LockHolder,
    },
    /// Response for a resource we no longer care about, or malformed.
    Ignored,
}

pub struct LockTracker {
    transport: Arc<dyn Transport>,
    claims: HashMap<ResourceKey, LockStatus>,
    // Claims dropped by a disconnect or never sent; re-requested on connect.
    suspended: HashSet<ResourceKey>,
    remote_holders: HashMap<ResourceKey, LockHolder>,
    clients: Vec<ClientInfo>,
    terminal_clients: HashMap<SessionId, Vec<ClientInfo>>,
}

impl fmt::Debug for LockTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTracker")
            .field("claims", &self.claims)
            .field("suspended", &self.suspended)
            .field("remote_holders", &self.remote_holders)
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl LockTracker {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            claims: HashMap::new(),
            suspended: HashSet::new(),
            remote_holders: HashMap::new(),
            clients: Vec::new(),
            terminal_clients: HashMap::new(),
        }
    }

    /// Sends a lock request unless one is already outstanding or held.
    /// Returns whether a request went out. A request that cannot be sent is
    /// retried by [`LockTracker::resume`].
    pub fn request_editing_lock(&mut self, resource: &ResourceKey) -> bool {
        if let Some(status) = self.claims.get(resource) {
            debug!(resource = %resource, ?status, "Editing lock already requested");
            return false;
        }
        let sent = self.transport.send(&OutboundMessage::EditingStarted {
            resource_id: resource.to_string(),
        });
        if sent {
            self.claims.insert(resource.clone(), LockStatus::Pending);
            debug!(resource = %resource, "Requested editing lock");
        } else {
            self.suspended.insert(resource.clone());
        }
        sent
    }

    /// Forgets the local claim and tells the server editing stopped.
    pub fn release_editing_lock(&mut self, resource: &ResourceKey) -> bool {
        let previous = self.claims.remove(resource);
        self.suspended.remove(resource);
        let sent = self.transport.send(&OutboundMessage::EditingStopped {
            resource_id: resource.to_string(),
        });
        debug!(resource = %resource, ?previous, sent, "Released editing lock");
        sent
    }

    pub fn status(&self, resource: &ResourceKey) -> LockStatus {
        self.claims.get(resource).copied().unwrap_or(LockStatus::Idle)
    }

    pub fn holder_of(&self, resource: &ResourceKey) -> Option<&LockHolder> {
        self.remote_holders.get(resource)
    }

    pub fn connected_clients(&self) -> &[ClientInfo] {
        &self.clients
    }

    pub fn terminal_clients(&self, id: &SessionId) -> &[ClientInfo] {
        self.terminal_clients
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn handle_lock_response(&mut self, payload: LockResponsePayload) -> LockOutcome {
        let Some(resource) = parse_resource(payload.resource_id.as_deref(), "editing_lock_response") else {
            return LockOutcome::Ignored;
        };
        if self.claims.get(&resource) != Some(&LockStatus::Pending) {
            // Blurred before the answer arrived; the release already went out.
            debug!(resource = %resource, "Lock response for a resource no longer pending");
            return LockOutcome::Ignored;
        }
        if payload.success.unwrap_or(false) {
            self.claims.insert(resource.clone(), LockStatus::Held);
            self.remote_holders.remove(&resource);
            info!(resource = %resource, "Editing lock granted");
            LockOutcome::Granted(resource)
        } else {
            self.claims.remove(&resource);
            let holder = payload
                .lock_info
                .map(|info| LockHolder {
                    client_id: info.client_id,
                    username: info.username,
                })
                .unwrap_or_default();
            self.remote_holders.insert(resource.clone(), holder.clone());
            info!(resource = %resource, holder = holder.display_name(), "Editing lock denied");
            LockOutcome::Denied { resource, holder }
        }
    }

    pub fn handle_unlock_response(&mut self, payload: LockResponsePayload) {
        if let Some(resource) = parse_resource(payload.resource_id.as_deref(), "editing_unlock_response") {
            debug!(resource = %resource, success = ?payload.success, "Editing unlock acknowledged");
        }
    }

    pub fn handle_lock_changed(&mut self, payload: LockChangedPayload) {
        let Some(resource) = parse_resource(payload.resource_id.as_deref(), "resource_lock_changed") else {
            return;
        };
        if payload.locked.unwrap_or(false) {
            let holder = LockHolder {
                client_id: payload.client_id,
                username: payload.username,
            };
            debug!(resource = %resource, holder = holder.display_name(), "Resource locked remotely");
            self.remote_holders.insert(resource, holder);
        } else {
            debug!(resource = %resource, "Resource unlocked remotely");
            self.remote_holders.remove(&resource);
        }
    }

    pub fn handle_clients_updated(&mut self, payload: ClientsPayload) {
        if let Some(count) = payload.count {
            if count != payload.clients.len() {
                debug!(count, listed = payload.clients.len(), "Client count disagrees with roster");
            }
        }
        self.clients = payload.clients;
    }

    /// `room` is used when the payload does not name its terminal; the server
    /// only sends presence updates for rooms this client has joined.
    pub fn handle_presence(&mut self, payload: PresencePayload, room: Option<SessionId>) {
        let Some(terminal) = payload.terminal_id.or(room) else {
            debug!("Presence update without a terminal; ignored");
            return;
        };
        debug!(
            terminal = %terminal,
            action = payload.action.as_deref().unwrap_or("unknown"),
            username = payload.username.as_deref().unwrap_or("Anonymous"),
            "Terminal presence changed"
        );
        if payload.clients.is_empty() {
            self.terminal_clients.remove(&terminal);
        } else {
            self.terminal_clients.insert(terminal, payload.clients);
        }
    }

    /// The server drops a client's locks when it disconnects. Local claims
    /// are kept aside until [`LockTracker::resume`].
    pub fn reset(&mut self) {
        if !self.claims.is_empty() {
            debug!(claims = self.claims.len(), "Suspending editing locks after disconnect");
        }
        self.suspended.extend(self.claims.drain().map(|(resource, _)| resource));
        self.remote_holders.clear();
        self.terminal_clients.clear();
    }

    /// Re-requests every suspended claim whose editor has not been blurred
    /// since. Returns how many requests went out.
    pub fn resume(&mut self) -> usize {
        let mut sent = 0;
        for resource in std::mem::take(&mut self.suspended) {
            if self.request_editing_lock(&resource) {
                sent += 1;
            }
        }
        if sent > 0 {
            info!(requests = sent, "Re-requested editing locks after reconnect");
        }
        sent
    }
}

fn parse_resource(raw: Option<&str>, event: &str) -> Option<ResourceKey> {
    let Some(raw) = raw else {
        warn!(event = %event, "Lock event missing resource_id");
        return None;
    };
    match raw.parse::<ResourceKey>() {
        Ok(resource) => Some(resource),
        Err(e) => {
            warn!(event = %event, error = %e, "Lock event with unrecognized resource");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::protocol::LockHolderInfo;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<OutboundMessage>>,
        offline: bool,
    }

    impl Transport for Recorder {
        fn send(&self, message: &OutboundMessage) -> bool {
            if self.offline {
                return false;
            }
            self.sent.lock().push(message.clone());
            true
        }

        fn is_connected(&self) -> bool {
            !self.offline
        }
    }

    fn tracker() -> (Arc<Recorder>, LockTracker) {
        let recorder = Arc::new(Recorder::default());
        let tracker = LockTracker::new(recorder.clone());
        (recorder, tracker)
    }

    #[test]
    fn resource_keys_round_trip_through_strings() {
        for raw in ["notes:global", "notes:9001", "playbook:recon.md"] {
            let key: ResourceKey = raw.parse().expect("valid key");
            assert_eq!(key.to_string(), raw);
        }
        assert_eq!(
            "notes:terminal_9001".parse::<ResourceKey>().expect("valid"),
            ResourceKey::SessionNotes(SessionId::from_port(9001))
        );
        assert!("notes".parse::<ResourceKey>().is_err());
        assert!("notes:".parse::<ResourceKey>().is_err());
        assert!("board:x".parse::<ResourceKey>().is_err());
    }

    #[test]
    fn repeated_focus_sends_a_single_request() {
        let (recorder, mut tracker) = tracker();
        assert!(tracker.request_editing_lock(&ResourceKey::GlobalNotes));
        assert!(!tracker.request_editing_lock(&ResourceKey::GlobalNotes));
        assert_eq!(tracker.status(&ResourceKey::GlobalNotes), LockStatus::Pending);
        assert_eq!(
            recorder.sent.lock().as_slice(),
            [OutboundMessage::EditingStarted {
                resource_id: "notes:global".into()
            }]
        );
    }

    #[test]
    fn grant_then_release() {
        let (recorder, mut tracker) = tracker();
        let key = ResourceKey::SessionNotes(SessionId::from_port(9001));
        tracker.request_editing_lock(&key);
        let outcome = tracker.handle_lock_response(LockResponsePayload {
            resource_id: Some("notes:9001".into()),
            success: Some(true),
            lock_info: None,
        });
        assert_eq!(outcome, LockOutcome::Granted(key.clone()));
        assert_eq!(tracker.status(&key), LockStatus::Held);

        assert!(tracker.release_editing_lock(&key));
        assert_eq!(tracker.status(&key), LockStatus::Idle);
        assert_eq!(
            recorder.sent.lock().last(),
            Some(&OutboundMessage::EditingStopped {
                resource_id: "notes:9001".into()
            })
        );
    }

    #[test]
    fn denial_records_holder_and_allows_retry() {
        let (_recorder, mut tracker) = tracker();
        let key = ResourceKey::Playbook("recon.md".into());
        tracker.request_editing_lock(&key);
        let outcome = tracker.handle_lock_response(LockResponsePayload {
            resource_id: Some("playbook:recon.md".into()),
            success: Some(false),
            lock_info: Some(LockHolderInfo {
                client_id: Some("sid-7".into()),
                username: Some("alice".into()),
            }),
        });
        let LockOutcome::Denied { holder, .. } = outcome else {
            panic!("expected denial");
        };
        assert_eq!(holder.display_name(), "alice");
        assert_eq!(tracker.holder_of(&key).map(|h| h.display_name()), Some("alice"));
        assert_eq!(tracker.status(&key), LockStatus::Idle);
        assert!(tracker.request_editing_lock(&key));
    }

    #[test]
    fn late_response_after_release_is_ignored() {
        let (_recorder, mut tracker) = tracker();
        tracker.request_editing_lock(&ResourceKey::GlobalNotes);
        tracker.release_editing_lock(&ResourceKey::GlobalNotes);
        let outcome = tracker.handle_lock_response(LockResponsePayload {
            resource_id: Some("notes:global".into()),
            success: Some(true),
            lock_info: None,
        });
        assert_eq!(outcome, LockOutcome::Ignored);
        assert_eq!(tracker.status(&ResourceKey::GlobalNotes), LockStatus::Idle);
    }

    #[test]
    fn offline_request_is_not_recorded() {
        let recorder = Arc::new(Recorder {
            offline: true,
            ..Default::default()
        });
        let mut tracker = LockTracker::new(recorder);
        assert!(!tracker.request_editing_lock(&ResourceKey::GlobalNotes));
        assert_eq!(tracker.status(&ResourceKey::GlobalNotes), LockStatus::Idle);
        assert!(tracker.suspended.contains(&ResourceKey::GlobalNotes));
    }

    #[test]
    fn remote_lock_changes_and_reset() {
        let (_recorder, mut tracker) = tracker();
        tracker.handle_lock_changed(LockChangedPayload {
            resource_id: Some("notes:global".into()),
            locked: Some(true),
            client_id: Some("sid-2".into()),
            username: Some("bob".into()),
        });
        assert!(tracker.holder_of(&ResourceKey::GlobalNotes).is_some());
        tracker.handle_lock_changed(LockChangedPayload {
            resource_id: Some("notes:global".into()),
            locked: Some(false),
            ..Default::default()
        });
        assert!(tracker.holder_of(&ResourceKey::GlobalNotes).is_none());

        tracker.request_editing_lock(&ResourceKey::GlobalNotes);
        tracker.reset();
        assert_eq!(tracker.status(&ResourceKey::GlobalNotes), LockStatus::Idle);
    }

    #[test]
    fn claims_survive_reconnect_unless_released() {
        let (recorder, mut tracker) = tracker();
        let notes = ResourceKey::SessionNotes(SessionId::from_port(9001));
        let playbook = ResourceKey::Playbook("recon.md".into());
        tracker.request_editing_lock(&notes);
        tracker.handle_lock_response(LockResponsePayload {
            resource_id: Some("notes:9001".into()),
            success: Some(true),
            lock_info: None,
        });
        tracker.request_editing_lock(&playbook);

        tracker.reset();
        assert_eq!(tracker.status(&notes), LockStatus::Idle);
        tracker.release_editing_lock(&playbook);
        recorder.sent.lock().clear();

        assert_eq!(tracker.resume(), 1);
        assert_eq!(tracker.status(&notes), LockStatus::Pending);
        assert_eq!(tracker.status(&playbook), LockStatus::Idle);
        assert_eq!(
            recorder.sent.lock().as_slice(),
            [OutboundMessage::EditingStarted {
                resource_id: "notes:9001".into()
            }]
        );
        assert_eq!(tracker.resume(), 0);
    }

    #[test]
    fn resume_while_offline_keeps_claims_suspended() {
        let recorder = Arc::new(Recorder::default());
        let mut tracker = LockTracker::new(recorder);
        tracker.request_editing_lock(&ResourceKey::GlobalNotes);
        tracker.reset();

        let offline: Arc<dyn Transport> = Arc::new(Recorder {
            offline: true,
            ..Default::default()
        });
        tracker.transport = offline;
        assert_eq!(tracker.resume(), 0);
        assert!(tracker.suspended.contains(&ResourceKey::GlobalNotes));
    }

    #[test]
    fn presence_falls_back_to_joined_room() {
        let (_recorder, mut tracker) = tracker();
        let room = SessionId::from_port(9001);
        tracker.handle_presence(
            PresencePayload {
                clients: vec![ClientInfo {
                    client_id: Some("sid-1".into()),
                    username: Some("alice".into()),
                    active_terminal: Some(room.clone()),
                }],
                action: Some("join".into()),
                ..Default::default()
            },
            Some(room.clone()),
        );
        assert_eq!(tracker.terminal_clients(&room).len(), 1);
        tracker.handle_clients_updated(ClientsPayload {
            clients: vec![ClientInfo::default(), ClientInfo::default()],
            count: Some(2),
        });
        assert_eq!(tracker.connected_clients().len(), 2);
    }
}
