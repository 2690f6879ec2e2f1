//! Contracts for the UI-owning collaborators the coordinator calls into.
//!
//! Every method has a no-op default, so an implementation only overrides what
//! it supports. A missing manager is `None` in [`Downstream`] and the
//! coordinator skips the call.

use crate::sync::store::SessionId;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{error, info, warn};

pub trait TerminalManager: Send {
    /// Materializes a tab for a terminal another client created.
    fn add_remote_terminal(&mut self, _id: &SessionId, _port: Option<u16>, _name: &str) {}

    fn rename_terminal(&mut self, _id: &SessionId, _name: &str) {}

    fn remove_terminal(&mut self, _id: &SessionId) {}

    fn activate_terminal(&mut self, _id: &SessionId) {}
}

pub trait VariableManager: Send {
    /// Prepares per-tab variable state for a newly known session.
    fn handle_new_tab(&mut self, _id: &SessionId) {}

    /// Re-renders the variable inputs of the active session.
    fn update_variable_ui(&mut self, _id: &SessionId, _variables: &BTreeMap<String, String>) {}
}

pub trait PlaybookManager: Send {
    fn load_playbook(&mut self, _name: &str) {}

    fn close_playbook(&mut self, _name: &str) {}
}

pub trait NotesManager: Send {
    fn update_tab_notes(&mut self, _id: &SessionId, _content: &str) {}

    fn update_global_notes(&mut self, _content: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub title: String,
    pub message: String,
    pub level: NoticeLevel,
    pub duration: Duration,
}

impl Notice {
    pub fn new(level: NoticeLevel, title: impl Into<String>, message: impl Into<String>) -> Self {
        let duration = match level {
            NoticeLevel::Warning | NoticeLevel::Error => Duration::from_secs(5),
            NoticeLevel::Info | NoticeLevel::Success => Duration::from_secs(3),
        };
        Self {
            title: title.into(),
            message: message.into(),
            level,
            duration,
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Info, title, message)
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Success, title, message)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Warning, title, message)
    }
}

/// Transient, user-facing messages (connection state, remote edits).
pub trait Notifier: Send {
    fn notify(&mut self, notice: Notice);
}

/// Writes notices to the log. Used by the headless binary.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info | NoticeLevel::Success => {
                info!(title = %notice.title, "{}", notice.message)
            }
            NoticeLevel::Warning => warn!(title = %notice.title, "{}", notice.message),
            NoticeLevel::Error => error!(title = %notice.title, "{}", notice.message),
        }
    }
}

/// The set of collaborators wired into a coordinator. Any of them may be absent.
#[derive(Default)]
pub struct Downstream {
    pub terminals: Option<Box<dyn TerminalManager>>,
    pub variables: Option<Box<dyn VariableManager>>,
    pub playbooks: Option<Box<dyn PlaybookManager>>,
    pub notes: Option<Box<dyn NotesManager>>,
    pub notifier: Option<Box<dyn Notifier>>,
}

impl std::fmt::Debug for Downstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downstream")
            .field("terminals", &self.terminals.is_some())
            .field("variables", &self.variables.is_some())
            .field("playbooks", &self.playbooks.is_some())
            .field("notes", &self.notes.is_some())
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

impl Downstream {
    pub fn with_terminals(mut self, manager: impl TerminalManager + 'static) -> Self {
        self.terminals = Some(Box::new(manager));
        self
    }

    pub fn with_variables(mut self, manager: impl VariableManager + 'static) -> Self {
        self.variables = Some(Box::new(manager));
        self
    }

    pub fn with_playbooks(mut self, manager: impl PlaybookManager + 'static) -> Self {
        self.playbooks = Some(Box::new(manager));
        self
    }

    pub fn with_notes(mut self, manager: impl NotesManager + 'static) -> Self {
        self.notes = Some(Box::new(manager));
        self
    }

    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Some(Box::new(notifier));
        self
    }

    pub(crate) fn notify(&mut self, notice: Notice) {
        if let Some(notifier) = self.notifier.as_mut() {
            notifier.notify(notice);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Collecting(Arc<Mutex<Vec<Notice>>>);

    impl Notifier for Collecting {
        fn notify(&mut self, notice: Notice) {
            self.0.lock().push(notice);
        }
    }

    struct TabsOnly;
    impl TerminalManager for TabsOnly {}

    #[test]
    fn notify_reaches_installed_notifier_only() {
        let mut bare = Downstream::default();
        bare.notify(Notice::info("ignored", "no notifier installed"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut downstream = Downstream::default().with_notifier(Collecting(seen.clone()));
        downstream.notify(Notice::warning("Connection lost", "retrying"));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].level, NoticeLevel::Warning);
        assert_eq!(seen[0].duration, Duration::from_secs(5));
    }

    #[test]
    fn default_methods_are_no_ops() {
        let mut downstream = Downstream::default().with_terminals(TabsOnly);
        let id = SessionId::from_port(9001);
        if let Some(terminals) = downstream.terminals.as_mut() {
            terminals.add_remote_terminal(&id, Some(9001), "Recon");
            terminals.activate_terminal(&id);
        }
        assert!(downstream.variables.is_none());
    }
}
