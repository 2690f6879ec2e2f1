//! Typed local event bus: what downstream managers raise when the user
//! changes something on this client.

use crate::error::{SyncError, SyncResult};
use crate::sync::locks::ResourceKey;
use crate::sync::store::SessionId;
use tokio::sync::mpsc;
use tracing::debug;

use super::coordinator::CoordinatorInput;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    TerminalTabCreated { port: u16, name: Option<String> },
    TerminalRenamed { port: u16, name: String },
    TerminalClosed { port: u16 },
    TerminalActivated { terminal_id: SessionId },
    VariableCreated { terminal_id: SessionId, name: String, value: String },
    VariableUpdated { terminal_id: SessionId, name: String, value: String },
    VariableDeleted { terminal_id: SessionId, name: String },
    PlaybookLoaded { terminal_id: SessionId, name: String },
    PlaybookUpdated { terminal_id: SessionId, name: String },
    PlaybookClosed { terminal_id: SessionId, name: String },
    NotesUpdated { terminal_id: SessionId, content: String },
    GlobalNotesUpdated { content: String },
    GlobalNotesOpened,
    GlobalNotesClosed,
    EditorFocused { resource: ResourceKey },
    EditorBlurred { resource: ResourceKey },
}

impl LocalEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LocalEvent::TerminalTabCreated { .. } => "terminal-tab-created",
            LocalEvent::TerminalRenamed { .. } => "terminal-renamed",
            LocalEvent::TerminalClosed { .. } => "terminal-closed",
            LocalEvent::TerminalActivated { .. } => "terminal-activated",
            LocalEvent::VariableCreated { .. } => "variable-created",
            LocalEvent::VariableUpdated { .. } => "variable-updated",
            LocalEvent::VariableDeleted { .. } => "variable-deleted",
            LocalEvent::PlaybookLoaded { .. } => "playbook-loaded",
            LocalEvent::PlaybookUpdated { .. } => "playbook-updated",
            LocalEvent::PlaybookClosed { .. } => "playbook-closed",
            LocalEvent::NotesUpdated { .. } => "notes-updated",
            LocalEvent::GlobalNotesUpdated { .. } => "global-notes-updated",
            LocalEvent::GlobalNotesOpened => "global-notes-opened",
            LocalEvent::GlobalNotesClosed => "global-notes-closed",
            LocalEvent::EditorFocused { .. } => "editor-focused",
            LocalEvent::EditorBlurred { .. } => "editor-blurred",
        }
    }
}

/// Handed to downstream managers so they can raise [`LocalEvent`]s.
#[derive(Debug, Clone)]
pub struct LocalEventSender {
    tx: mpsc::UnboundedSender<CoordinatorInput>,
}

impl LocalEventSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<CoordinatorInput>) -> Self {
        Self { tx }
    }

    pub fn try_publish(&self, event: LocalEvent) -> SyncResult<()> {
        let name = event.name();
        self.tx
            .send(CoordinatorInput::Local(event))
            .map_err(|_| SyncError::ChannelClosed(format!("coordinator stopped before {}", name)))
    }

    /// Returns `false` once the coordinator has stopped.
    pub fn publish(&self, event: LocalEvent) -> bool {
        match self.try_publish(event) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Local event dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reports_stopped_coordinator() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = LocalEventSender::new(tx);
        assert!(sender.publish(LocalEvent::GlobalNotesOpened));
        drop(rx);
        assert!(matches!(
            sender.try_publish(LocalEvent::GlobalNotesClosed),
            Err(SyncError::ChannelClosed(_))
        ));
        assert!(!sender.publish(LocalEvent::GlobalNotesClosed));
    }
}
