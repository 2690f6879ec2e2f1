//! The hub between local edits, the collaboration server and the store.
//!
//! Everything runs on one task. Remote events, local events and the results
//! of backend calls arrive through a single inbox and are applied in order;
//! the only suspension points are the inbox itself, the next debounce
//! deadline and the optional reconciliation tick. Backend I/O is spawned and
//! reports back through the inbox, so a slow request never stalls delivery.

use crate::backend::{Backend, TerminalListing};
use crate::config::Config;
use crate::sync::debounce::{Debouncer, Flushed};
use crate::sync::events::{LocalEvent, LocalEventSender};
use crate::sync::locks::{LockOutcome, LockTracker};
use crate::sync::managers::{Downstream, Notice};
use crate::sync::store::{NotesScope, SessionId, SessionStore, StoreReader, TerminalSession};
use crate::transport::protocol::{
    NotesPayload, PlaybookAction, PlaybookPayload, TerminalPayload, VariableAction, VariablePayload,
    INBOUND_EVENTS,
};
use crate::transport::{OutboundMessage, RemoteEvent, Transport, TransportChannel};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Everything the coordinator reacts to.
#[derive(Debug)]
pub enum CoordinatorInput {
    Remote(RemoteEvent),
    Local(LocalEvent),
    VariablesLoaded {
        session: SessionId,
        variables: BTreeMap<String, String>,
    },
    TerminalsListed(Vec<TerminalListing>),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableKey {
    pub session: SessionId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlaybookKey {
    pub session: SessionId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingVariable {
    pub action: VariableAction,
    pub value: Option<String>,
}

/// Cloneable way into a running coordinator's inbox.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorInput>,
}

impl CoordinatorHandle {
    pub fn local_events(&self) -> LocalEventSender {
        LocalEventSender::new(self.tx.clone())
    }

    /// Decodes a named inbound frame and queues it. Unknown names are
    /// ignored; malformed payloads are logged and dropped.
    pub fn deliver(&self, event: &str, data: &Value) -> bool {
        match RemoteEvent::from_parts(event, data) {
            Ok(Some(remote)) => self.tx.send(CoordinatorInput::Remote(remote)).is_ok(),
            Ok(None) => {
                debug!(event = %event, "Ignoring unknown inbound event");
                false
            }
            Err(e) => {
                warn!(event = %event, error = %e, "Dropping malformed inbound event");
                false
            }
        }
    }

    /// Asks the coordinator to flush pending edits and stop.
    pub fn shutdown(&self) -> bool {
        self.tx.send(CoordinatorInput::Shutdown).is_ok()
    }
}

pub struct SyncCoordinator {
    store: SessionStore,
    transport: Arc<dyn Transport>,
    backend: Arc<dyn Backend>,
    locks: LockTracker,
    downstream: Downstream,
    variables: Debouncer<VariableKey, PendingVariable>,
    playbooks: Debouncer<PlaybookKey, PlaybookAction>,
    notes: Debouncer<NotesScope, String>,
    rooms: HashSet<SessionId>,
    reconcile_interval: Option<Duration>,
    tx: mpsc::UnboundedSender<CoordinatorInput>,
    inbox: mpsc::UnboundedReceiver<CoordinatorInput>,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("sessions", &self.store.len())
            .field("pending_variables", &self.variables.len())
            .field("pending_playbooks", &self.playbooks.len())
            .field("pending_notes", &self.notes.len())
            .field("downstream", &self.downstream)
            .finish()
    }
}

impl SyncCoordinator {
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn Backend>,
        downstream: Downstream,
    ) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        let window = config.debounce_window;
        Self {
            store: SessionStore::new(),
            locks: LockTracker::new(transport.clone()),
            transport,
            backend,
            downstream,
            variables: Debouncer::new(window),
            playbooks: Debouncer::new(window),
            notes: Debouncer::new(window),
            rooms: HashSet::new(),
            reconcile_interval: config.reconcile_interval,
            tx,
            inbox,
        }
    }

    pub fn store(&self) -> StoreReader {
        self.store.reader()
    }

    pub fn locks(&self) -> &LockTracker {
        &self.locks
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle { tx: self.tx.clone() }
    }

    pub fn local_events(&self) -> LocalEventSender {
        LocalEventSender::new(self.tx.clone())
    }

    /// Subscribes to every inbound event the coordinator understands.
    pub fn attach(&self, channel: &TransportChannel) {
        for &event in INBOUND_EVENTS {
            let handle = self.handle();
            channel.on(event, move |data| {
                handle.deliver(event, data);
            });
        }
        // Relayed room broadcasts use a different name for the same payload.
        let handle = self.handle();
        channel.on("variable_changed", move |data| {
            handle.deliver("variable_changed", data);
        });
    }

    /// Processes inputs until [`CoordinatorHandle::shutdown`], then flushes
    /// every pending debounced message.
    #[instrument(skip(self))]
    pub async fn run(&mut self) {
        let mut reconcile = self.reconcile_interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        info!(reconcile = ?self.reconcile_interval, "Sync coordinator running");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                input = self.inbox.recv() => match input {
                    Some(CoordinatorInput::Shutdown) | None => break,
                    Some(input) => self.handle_input(input),
                },
                _ = wait_until(deadline) => self.flush_due(Instant::now()),
                _ = wait_tick(&mut reconcile) => self.reconcile(),
            }
        }

        self.flush_all();
        info!("Sync coordinator stopped");
    }

    fn handle_input(&mut self, input: CoordinatorInput) {
        match input {
            CoordinatorInput::Remote(event) => self.handle_remote(event),
            CoordinatorInput::Local(event) => self.handle_local(event, Instant::now()),
            CoordinatorInput::VariablesLoaded { session, variables } => {
                self.apply_loaded_variables(&session, variables)
            }
            CoordinatorInput::TerminalsListed(listings) => self.apply_terminal_list(listings),
            CoordinatorInput::Shutdown => {}
        }
    }

    fn handle_remote(&mut self, event: RemoteEvent) {
        debug!(event = event.name(), "Applying remote event");
        match event {
            RemoteEvent::TerminalCreated(payload) => self.apply_terminal_created(payload, true),
            RemoteEvent::TerminalRenamed(payload) => self.apply_terminal_renamed(payload),
            RemoteEvent::TerminalClosed(payload) => self.apply_terminal_closed(payload),
            RemoteEvent::VariableChanged(payload) => self.apply_variable_changed(payload),
            RemoteEvent::PlaybookChanged(payload) => self.apply_playbook_changed(payload),
            RemoteEvent::NotesChanged(payload) => self.apply_notes_changed(payload),
            RemoteEvent::GlobalNotesChanged(payload) => self.apply_global_notes_changed(payload),
            RemoteEvent::EditingLockResponse(payload) => {
                if let LockOutcome::Denied { resource, holder } = self.locks.handle_lock_response(payload) {
                    self.downstream.notify(Notice::warning(
                        "Editing locked",
                        format!("{} is currently editing {}", holder.display_name(), resource),
                    ));
                }
            }
            RemoteEvent::EditingUnlockResponse(payload) => self.locks.handle_unlock_response(payload),
            RemoteEvent::ResourceLockChanged(payload) => self.locks.handle_lock_changed(payload),
            RemoteEvent::ClientsUpdated(payload) => self.locks.handle_clients_updated(payload),
            RemoteEvent::TerminalPresence(payload) => {
                let room = self.store.active_session();
                self.locks.handle_presence(payload, room);
            }
            RemoteEvent::ConnectionEstablished(_) => self.on_connected(),
            RemoteEvent::ConnectionLost(_) => self.on_disconnected(),
            RemoteEvent::Reconnecting(payload) => {
                info!(attempt = payload.attempt, "Reconnecting to collaboration server");
                if payload.attempt > 1 {
                    self.downstream.notify(Notice::info(
                        "Reconnecting",
                        format!(
                            "Reconnecting to collaboration server (attempt {})...",
                            payload.attempt
                        ),
                    ));
                }
            }
        }
    }

    // ---- remote terminal events ----

    fn apply_terminal_created(&mut self, payload: TerminalPayload, announce: bool) {
        let Some(id) = payload.session_id() else {
            warn!(?payload, "terminal_created without terminal_id or port");
            return;
        };
        if self.store.contains(&id) {
            debug!(session = %id, "Terminal already known; ignoring creation");
            return;
        }
        let name = payload
            .name
            .unwrap_or_else(|| TerminalSession::placeholder_name(&id));
        self.store.insert_session(id.clone(), payload.port, name.clone());
        info!(session = %id, name = %name, "Remote terminal added");

        let port = self.store.session(&id).and_then(|s| s.port);
        match self.downstream.terminals.as_mut() {
            Some(terminals) => terminals.add_remote_terminal(&id, port, &name),
            None => debug!(session = %id, "No terminal manager; tab not materialized"),
        }
        if let Some(variables) = self.downstream.variables.as_mut() {
            variables.handle_new_tab(&id);
        }
        self.join_room(&id);
        self.spawn_variable_load(id);

        if announce {
            self.downstream.notify(Notice::info(
                "New terminal created",
                format!("New terminal \"{}\" created by another user", name),
            ));
        }
    }

    fn apply_terminal_renamed(&mut self, payload: TerminalPayload) {
        let Some(id) = payload.session_id() else {
            warn!(?payload, "terminal_renamed without terminal_id or port");
            return;
        };
        let Some(name) = payload.name else {
            warn!(session = %id, "terminal_renamed without name");
            return;
        };
        if !self.store.rename_session(&id, name.clone()) {
            debug!(session = %id, "Rename for unknown terminal ignored");
            return;
        }
        info!(session = %id, name = %name, "Remote terminal renamed");
        if let Some(terminals) = self.downstream.terminals.as_mut() {
            terminals.rename_terminal(&id, &name);
        }
        self.downstream.notify(Notice::info(
            "Terminal renamed",
            format!("Terminal renamed to \"{}\" by another user", name),
        ));
    }

    fn apply_terminal_closed(&mut self, payload: TerminalPayload) {
        let Some(id) = payload.session_id() else {
            warn!(?payload, "terminal_closed without terminal_id or port");
            return;
        };
        let was_active = self.store.is_active(&id);
        let Some(removed) = self.store.remove_session(&id) else {
            debug!(session = %id, "Close for unknown terminal ignored");
            return;
        };
        info!(session = %id, "Remote terminal closed");
        self.rooms.remove(&id);
        if let Some(terminals) = self.downstream.terminals.as_mut() {
            terminals.remove_terminal(&id);
        }

        if was_active {
            if let Some(next) = self.store.session_ids().into_iter().next() {
                self.activate(next);
            }
        }
        self.downstream.notify(Notice::info(
            "Terminal closed",
            format!("Terminal \"{}\" was closed by another user", removed.name),
        ));
    }

    fn activate(&mut self, id: SessionId) {
        self.switch_active(id.clone());
        if let Some(terminals) = self.downstream.terminals.as_mut() {
            terminals.activate_terminal(&id);
        }
    }

    // ---- remote content events ----

    fn apply_variable_changed(&mut self, payload: VariablePayload) {
        let (Some(id), Some(name), Some(raw_action)) = (payload.terminal_id, payload.name, payload.action) else {
            warn!("remote_variable_update missing terminal_id, name or action");
            return;
        };
        let action = match VariableAction::parse(&raw_action) {
            Ok(action) => action,
            Err(e) => {
                warn!(session = %id, variable = %name, error = %e, "Rejecting variable update");
                return;
            }
        };
        let value = match (action, payload.value) {
            (VariableAction::Delete, _) => None,
            (_, Some(value)) => Some(value),
            (_, None) => {
                warn!(session = %id, variable = %name, "Variable {} without value", action.past_tense());
                return;
            }
        };

        if self.store.ensure_session(&id) {
            debug!(session = %id, "Created placeholder session for variable update");
        }
        match &value {
            Some(value) => {
                self.store.set_variable(&id, &name, value.clone());
            }
            None => {
                self.store.remove_variable(&id, &name);
            }
        }
        self.spawn_variable_persist(id.clone(), name.clone(), action, value);

        if self.store.is_active(&id) {
            self.rerender_variables(&id);
            self.downstream.notify(Notice::info(
                format!("Variable {}", action.past_tense()),
                format!("Variable \"{}\" {} by another user", name, action.past_tense()),
            ));
        }
    }

    fn apply_playbook_changed(&mut self, payload: PlaybookPayload) {
        let (Some(id), Some(name), Some(raw_action)) = (payload.terminal_id, payload.name, payload.action) else {
            warn!("playbook_changed missing terminal_id, name or action");
            return;
        };
        let action = match PlaybookAction::parse(&raw_action) {
            Ok(action) => action,
            Err(e) => {
                warn!(session = %id, playbook = %name, error = %e, "Rejecting playbook change");
                return;
            }
        };
        if !self.store.is_active(&id) {
            debug!(session = %id, playbook = %name, "Playbook change for background session ignored");
            return;
        }

        let loaded = self.store.has_playbook(&id, &name);
        let applied = match action {
            PlaybookAction::Load if loaded => {
                debug!(playbook = %name, "Playbook already loaded");
                false
            }
            PlaybookAction::Load => {
                self.store.add_playbook(&id, &name);
                if let Some(playbooks) = self.downstream.playbooks.as_mut() {
                    playbooks.load_playbook(&name);
                }
                true
            }
            PlaybookAction::Update if loaded => {
                if let Some(playbooks) = self.downstream.playbooks.as_mut() {
                    playbooks.load_playbook(&name);
                }
                true
            }
            PlaybookAction::Close if loaded => {
                self.store.remove_playbook(&id, &name);
                if let Some(playbooks) = self.downstream.playbooks.as_mut() {
                    playbooks.close_playbook(&name);
                }
                true
            }
            PlaybookAction::Update | PlaybookAction::Close => {
                debug!(playbook = %name, "Playbook not open here; nothing to {}", raw_action);
                false
            }
        };

        if applied {
            self.downstream.notify(Notice::info(
                format!("Playbook {}", action.past_tense()),
                format!("Playbook \"{}\" {} by another user", name, action.past_tense()),
            ));
        }
    }

    fn apply_notes_changed(&mut self, payload: NotesPayload) {
        let (Some(id), Some(content)) = (payload.terminal_id, payload.content) else {
            warn!("notes_changed missing terminal_id or content");
            return;
        };
        if !self.store.notes_visible(&NotesScope::Session(id.clone())) {
            debug!(session = %id, "Notes change for hidden session dropped");
            return;
        }
        if let Some(notes) = self.downstream.notes.as_mut() {
            notes.update_tab_notes(&id, &content);
        }
        self.downstream.notify(Notice::info(
            "Notes updated",
            "Terminal notes updated by another user",
        ));
    }

    fn apply_global_notes_changed(&mut self, payload: NotesPayload) {
        let Some(content) = payload.content else {
            warn!("global_notes_changed missing content");
            return;
        };
        if !self.store.notes_visible(&NotesScope::Global) {
            debug!("Global notes change dropped; pane closed");
            return;
        }
        if let Some(notes) = self.downstream.notes.as_mut() {
            notes.update_global_notes(&content);
        }
        self.downstream.notify(Notice::info(
            "Global notes updated",
            "Global notes updated by another user",
        ));
    }

    // ---- connection lifecycle ----

    fn on_connected(&mut self) {
        info!("Collaboration channel established; catching up");
        self.downstream.notify(Notice::success(
            "Connected to collaboration server",
            "Real-time synchronization enabled",
        ));
        // Room membership does not survive a reconnect; join again.
        let previous = std::mem::take(&mut self.rooms);
        if let Some(active) = self.store.active_session() {
            self.join_room(&active);
        }
        let mut background: Vec<SessionId> = previous
            .into_iter()
            .filter(|id| self.store.contains(id))
            .collect();
        background.sort();
        for id in &background {
            self.join_room(id);
        }
        self.locks.resume();
        self.spawn_terminal_list();
    }

    fn on_disconnected(&mut self) {
        self.locks.reset();
        self.downstream.notify(Notice::warning(
            "Connection lost",
            "Connection to collaboration server lost. Attempting to reconnect...",
        ));
    }

    fn reconcile(&mut self) {
        debug!("Reconciling with backend");
        self.spawn_terminal_list();
        if let Some(active) = self.store.active_session() {
            self.spawn_variable_load(active);
        }
    }

    fn apply_terminal_list(&mut self, listings: Vec<TerminalListing>) {
        let before = self.store.len();
        for listing in listings {
            let Some(port) = listing.port else {
                debug!(?listing, "Listed terminal without port skipped");
                continue;
            };
            self.apply_terminal_created(
                TerminalPayload {
                    terminal_id: Some(SessionId::from_port(port)),
                    port: Some(port),
                    name: listing.name,
                },
                false,
            );
        }
        let added = self.store.len().saturating_sub(before);
        if added > 0 {
            info!(added, "Restored terminals from backend");
        }
    }

    /// Backend snapshots are authoritative, except for names with a local
    /// edit still waiting in the debouncer.
    fn apply_loaded_variables(&mut self, session: &SessionId, variables: BTreeMap<String, String>) {
        let pending = &self.variables;
        let changed = self.store.reconcile_variables(session, variables, |name| {
            pending.is_pending(&VariableKey {
                session: session.clone(),
                name: name.to_string(),
            })
        });
        debug!(session = %session, changed, "Reconciled persisted variables");
        if changed > 0 && self.store.is_active(session) {
            self.rerender_variables(session);
        }
    }

    fn rerender_variables(&mut self, id: &SessionId) {
        if let Some(manager) = self.downstream.variables.as_mut() {
            manager.update_variable_ui(id, &self.store.variables(id));
        }
    }

    // ---- local events ----

    fn handle_local(&mut self, event: LocalEvent, now: Instant) {
        debug!(event = event.name(), "Local event");
        match event {
            LocalEvent::TerminalTabCreated { port, name } => {
                let id = SessionId::from_port(port);
                let name = name.unwrap_or_else(|| TerminalSession::placeholder_name(&id));
                if !self.store.insert_session(id.clone(), Some(port), name.clone()) {
                    debug!(session = %id, "Local tab already known; not broadcasting");
                    return;
                }
                self.transport.send(&OutboundMessage::TerminalCreated {
                    terminal_id: id,
                    port,
                    name,
                });
            }
            LocalEvent::TerminalRenamed { port, name } => {
                let id = SessionId::from_port(port);
                if !self.store.rename_session(&id, name.clone()) {
                    self.store.insert_session(id.clone(), Some(port), name.clone());
                }
                self.transport.send(&OutboundMessage::TerminalRenamed {
                    terminal_id: id,
                    port,
                    name,
                });
            }
            LocalEvent::TerminalClosed { port } => {
                let id = SessionId::from_port(port);
                self.store.remove_session(&id);
                self.leave_room(&id);
                self.transport.send(&OutboundMessage::TerminalClosed { terminal_id: id, port });
            }
            LocalEvent::TerminalActivated { terminal_id } => {
                self.store.ensure_session(&terminal_id);
                self.switch_active(terminal_id);
            }
            LocalEvent::VariableCreated { terminal_id, name, value } => {
                self.stage_variable(terminal_id, name, VariableAction::Create, Some(value), now)
            }
            LocalEvent::VariableUpdated { terminal_id, name, value } => {
                self.stage_variable(terminal_id, name, VariableAction::Update, Some(value), now)
            }
            LocalEvent::VariableDeleted { terminal_id, name } => {
                self.stage_variable(terminal_id, name, VariableAction::Delete, None, now)
            }
            LocalEvent::PlaybookLoaded { terminal_id, name } => {
                self.stage_playbook(terminal_id, name, PlaybookAction::Load, now)
            }
            LocalEvent::PlaybookUpdated { terminal_id, name } => {
                self.stage_playbook(terminal_id, name, PlaybookAction::Update, now)
            }
            LocalEvent::PlaybookClosed { terminal_id, name } => {
                self.stage_playbook(terminal_id, name, PlaybookAction::Close, now)
            }
            LocalEvent::NotesUpdated { terminal_id, content } => {
                self.notes.schedule(NotesScope::Session(terminal_id), content, now);
            }
            LocalEvent::GlobalNotesUpdated { content } => {
                self.notes.schedule(NotesScope::Global, content, now);
            }
            LocalEvent::GlobalNotesOpened => self.store.set_global_notes_open(true),
            LocalEvent::GlobalNotesClosed => self.store.set_global_notes_open(false),
            LocalEvent::EditorFocused { resource } => {
                self.locks.request_editing_lock(&resource);
            }
            LocalEvent::EditorBlurred { resource } => {
                self.locks.release_editing_lock(&resource);
            }
        }
    }

    fn stage_variable(
        &mut self,
        session: SessionId,
        name: String,
        action: VariableAction,
        value: Option<String>,
        now: Instant,
    ) {
        self.store.ensure_session(&session);
        match &value {
            Some(value) => {
                self.store.set_variable(&session, &name, value.clone());
            }
            None => {
                self.store.remove_variable(&session, &name);
            }
        }
        let key = VariableKey { session, name };
        if self.variables.schedule(key, PendingVariable { action, value }, now) {
            debug!("Coalesced pending variable change");
        }
    }

    fn stage_playbook(&mut self, session: SessionId, name: String, action: PlaybookAction, now: Instant) {
        self.store.ensure_session(&session);
        match action {
            PlaybookAction::Load => {
                self.store.add_playbook(&session, &name);
            }
            PlaybookAction::Close => {
                self.store.remove_playbook(&session, &name);
            }
            PlaybookAction::Update => {}
        }
        self.playbooks.schedule(PlaybookKey { session, name }, action, now);
    }

    fn switch_active(&mut self, id: SessionId) {
        let previous = self.store.set_active(Some(id.clone()));
        if previous.as_ref() == Some(&id) {
            return;
        }
        if let Some(previous) = previous {
            self.leave_room(&previous);
        }
        self.join_room(&id);
    }

    fn join_room(&mut self, id: &SessionId) {
        if self.rooms.contains(id) {
            return;
        }
        if self.transport.send(&OutboundMessage::JoinTerminal {
            terminal_id: id.clone(),
        }) {
            self.rooms.insert(id.clone());
        }
    }

    fn leave_room(&mut self, id: &SessionId) {
        if self.rooms.remove(id) {
            self.transport.send(&OutboundMessage::LeaveTerminal {
                terminal_id: id.clone(),
            });
        }
    }

    // ---- debounced flushing ----

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.variables.next_deadline(),
            self.playbooks.next_deadline(),
            self.notes.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn flush_due(&mut self, now: Instant) {
        let variables = self.variables.take_due(now);
        let playbooks = self.playbooks.take_due(now);
        let notes = self.notes.take_due(now);
        self.send_flushed(variables, playbooks, notes);
    }

    fn flush_all(&mut self) {
        let variables = self.variables.take_all();
        let playbooks = self.playbooks.take_all();
        let notes = self.notes.take_all();
        let total = variables.len() + playbooks.len() + notes.len();
        if total > 0 {
            info!(pending = total, "Flushing pending edits before shutdown");
        }
        self.send_flushed(variables, playbooks, notes);
    }

    fn send_flushed(
        &mut self,
        variables: Vec<Flushed<VariableKey, PendingVariable>>,
        playbooks: Vec<Flushed<PlaybookKey, PlaybookAction>>,
        notes: Vec<Flushed<NotesScope, String>>,
    ) {
        let total = variables.len() + playbooks.len() + notes.len();
        if total > 0 && !self.transport.is_connected() {
            warn!(dropped = total, "Not connected; flushed edits will not reach other clients");
        }
        for Flushed { key, payload, coalesced } in variables {
            debug!(session = %key.session, variable = %key.name, coalesced, "Sending variable change");
            self.transport.send(&OutboundMessage::VariableUpdated {
                terminal_id: key.session,
                name: key.name,
                value: payload.value,
                action: payload.action,
            });
        }
        for Flushed { key, payload, coalesced } in playbooks {
            debug!(session = %key.session, playbook = %key.name, coalesced, "Sending playbook change");
            self.transport.send(&OutboundMessage::PlaybookUpdated {
                terminal_id: key.session,
                name: key.name,
                action: payload,
            });
        }
        for Flushed { key, payload, coalesced } in notes {
            debug!(scope = ?key, coalesced, "Sending notes update");
            self.transport.send(&OutboundMessage::NotesUpdated {
                terminal_id: key.session().cloned(),
                content: payload,
            });
        }
    }

    // ---- backend I/O ----

    fn spawn_variable_load(&self, session: SessionId) {
        let backend = self.backend.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match backend.load_variables(&session).await {
                Ok(variables) => {
                    let _ = tx.send(CoordinatorInput::VariablesLoaded { session, variables });
                }
                Err(e) => error!(session = %session, error = %e, "Failed to load variables"),
            }
        });
    }

    fn spawn_terminal_list(&self) {
        let backend = self.backend.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            match backend.list_terminals().await {
                Ok(listings) => {
                    let _ = tx.send(CoordinatorInput::TerminalsListed(listings));
                }
                Err(e) => error!(error = %e, "Failed to fetch terminal list"),
            }
        });
    }

    /// Mirrors a remote variable change into the backend. Failures are
    /// logged; the applied change is not rolled back.
    fn spawn_variable_persist(
        &self,
        session: SessionId,
        name: String,
        action: VariableAction,
        value: Option<String>,
    ) {
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let value = value.unwrap_or_default();
            let result = match action {
                VariableAction::Create => backend.create_variable(&session, &name, &value).await,
                VariableAction::Update => backend.update_variable(&session, &name, &value).await,
                VariableAction::Delete => backend.delete_variable(&session, &name).await,
            };
            if let Err(e) = result {
                error!(session = %session, variable = %name, error = %e, "Failed to persist variable");
            }
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn wait_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}
