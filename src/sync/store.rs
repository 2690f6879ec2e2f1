//! Shared client-side state: terminal sessions, their variables and open
//! playbooks, plus the small amount of UI state the sync layer consults
//! (active tab, whether the global notes pane is open).
//!
//! [`SessionStore`] is the only handle with mutators and is owned by the
//! coordinator. Downstream managers receive a [`StoreReader`].

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// Port-derived terminal identifier. Stable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn from_port(port: u16) -> Self {
        SessionId(port.to_string())
    }

    /// Normalizes identifiers seen on the wire. `terminal-9001`,
    /// `terminal_9001` and `9001` all map to `9001`; ids without a numeric
    /// suffix are kept verbatim.
    pub fn from_wire(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let digits_start = raw
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(i, _)| i);
        match digits_start {
            Some(i) => Some(SessionId(raw[i..].to_string())),
            None => Some(SessionId(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn port(&self) -> Option<u16> {
        self.0.parse().ok()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which notes document a change refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NotesScope {
    Global,
    Session(SessionId),
}

impl NotesScope {
    pub fn session(&self) -> Option<&SessionId> {
        match self {
            NotesScope::Global => None,
            NotesScope::Session(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybookDescriptor {
    pub name: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminalSession {
    pub id: SessionId,
    pub port: Option<u16>,
    pub name: String,
    pub variables: BTreeMap<String, String>,
    pub playbooks: BTreeMap<String, PlaybookDescriptor>,
}

impl TerminalSession {
    fn new(id: SessionId, port: Option<u16>, name: String) -> Self {
        Self {
            port: port.or_else(|| id.port()),
            id,
            name,
            variables: BTreeMap::new(),
            playbooks: BTreeMap::new(),
        }
    }

    pub fn placeholder_name(id: &SessionId) -> String {
        format!("Terminal {}", id)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    // Insertion order doubles as tab order.
    sessions: IndexMap<SessionId, TerminalSession>,
    active: Option<SessionId>,
    global_notes_open: bool,
}

/// Read-only view of the shared state.
#[derive(Debug, Clone, Default)]
pub struct StoreReader {
    state: Arc<RwLock<StoreState>>,
}

impl StoreReader {
    pub fn contains(&self, id: &SessionId) -> bool {
        self.state.read().sessions.contains_key(id)
    }

    pub fn session(&self, id: &SessionId) -> Option<TerminalSession> {
        self.state.read().sessions.get(id).cloned()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.state.read().sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().sessions.is_empty()
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.state.read().active.clone()
    }

    pub fn is_active(&self, id: &SessionId) -> bool {
        self.state.read().active.as_ref() == Some(id)
    }

    pub fn variables(&self, id: &SessionId) -> BTreeMap<String, String> {
        self.state
            .read()
            .sessions
            .get(id)
            .map(|s| s.variables.clone())
            .unwrap_or_default()
    }

    pub fn variable(&self, id: &SessionId, name: &str) -> Option<String> {
        self.state
            .read()
            .sessions
            .get(id)
            .and_then(|s| s.variables.get(name).cloned())
    }

    pub fn has_playbook(&self, id: &SessionId, name: &str) -> bool {
        self.state
            .read()
            .sessions
            .get(id)
            .is_some_and(|s| s.playbooks.contains_key(name))
    }

    /// Whether a notes document is currently visible. Session notes are
    /// shown alongside their tab, so they are visible while the tab is active.
    pub fn notes_visible(&self, scope: &NotesScope) -> bool {
        let state = self.state.read();
        match scope {
            NotesScope::Global => state.global_notes_open,
            NotesScope::Session(id) => state.active.as_ref() == Some(id),
        }
    }
}

/// Owning, mutating handle. Not `Clone`: there is exactly one writer.
#[derive(Debug, Default)]
pub struct SessionStore {
    reader: StoreReader,
}

impl Deref for SessionStore {
    type Target = StoreReader;

    fn deref(&self) -> &StoreReader {
        &self.reader
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reader(&self) -> StoreReader {
        self.reader.clone()
    }

    /// Returns `false` when the id is already present; the existing entry is
    /// left untouched.
    pub(crate) fn insert_session(&mut self, id: SessionId, port: Option<u16>, name: String) -> bool {
        let mut state = self.reader.state.write();
        if state.sessions.contains_key(&id) {
            return false;
        }
        state
            .sessions
            .insert(id.clone(), TerminalSession::new(id, port, name));
        true
    }

    /// Creates a placeholder session if `id` is unknown. Returns `true` if one
    /// was created.
    pub(crate) fn ensure_session(&mut self, id: &SessionId) -> bool {
        let name = TerminalSession::placeholder_name(id);
        self.insert_session(id.clone(), None, name)
    }

    pub(crate) fn rename_session(&mut self, id: &SessionId, name: String) -> bool {
        match self.reader.state.write().sessions.get_mut(id) {
            Some(session) => {
                session.name = name;
                true
            }
            None => false,
        }
    }

    /// Removes the session, clearing the active marker if it pointed here.
    pub(crate) fn remove_session(&mut self, id: &SessionId) -> Option<TerminalSession> {
        let mut state = self.reader.state.write();
        let removed = state.sessions.shift_remove(id);
        if removed.is_some() && state.active.as_ref() == Some(id) {
            state.active = None;
        }
        removed
    }

    pub(crate) fn set_variable(&mut self, id: &SessionId, name: &str, value: String) -> Option<String> {
        let mut state = self.reader.state.write();
        let session = state.sessions.get_mut(id)?;
        session.variables.insert(name.to_string(), value)
    }

    pub(crate) fn remove_variable(&mut self, id: &SessionId, name: &str) -> Option<String> {
        let mut state = self.reader.state.write();
        state.sessions.get_mut(id)?.variables.remove(name)
    }

    /// Makes the session's variables match a snapshot loaded from the
    /// backend. Names for which `keep_local` returns `true` are left as they
    /// are, whatever the snapshot says. Returns how many variables changed.
    pub(crate) fn reconcile_variables<F>(
        &mut self,
        id: &SessionId,
        loaded: BTreeMap<String, String>,
        keep_local: F,
    ) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let mut state = self.reader.state.write();
        let Some(session) = state.sessions.get_mut(id) else {
            return 0;
        };
        let before = session.variables.len();
        session
            .variables
            .retain(|name, _| keep_local(name) || loaded.contains_key(name));
        let mut changed = before - session.variables.len();
        for (name, value) in loaded {
            if keep_local(&name) {
                continue;
            }
            if session.variables.get(&name) != Some(&value) {
                session.variables.insert(name, value);
                changed += 1;
            }
        }
        changed
    }

    pub(crate) fn add_playbook(&mut self, id: &SessionId, name: &str) -> bool {
        let mut state = self.reader.state.write();
        let Some(session) = state.sessions.get_mut(id) else {
            return false;
        };
        if session.playbooks.contains_key(name) {
            return false;
        }
        session.playbooks.insert(
            name.to_string(),
            PlaybookDescriptor {
                name: name.to_string(),
                opened_at: Utc::now(),
            },
        );
        true
    }

    pub(crate) fn remove_playbook(&mut self, id: &SessionId, name: &str) -> bool {
        let mut state = self.reader.state.write();
        state
            .sessions
            .get_mut(id)
            .is_some_and(|s| s.playbooks.remove(name).is_some())
    }

    /// Returns the previously active session.
    pub(crate) fn set_active(&mut self, id: Option<SessionId>) -> Option<SessionId> {
        std::mem::replace(&mut self.reader.state.write().active, id)
    }

    pub(crate) fn set_global_notes_open(&mut self, open: bool) {
        self.reader.state.write().global_notes_open = open;
    }
}
