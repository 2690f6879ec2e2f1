pub mod coordinator;
pub mod debounce;
pub mod events;
pub mod locks;
pub mod managers;
pub mod store;

pub use coordinator::{CoordinatorHandle, CoordinatorInput, SyncCoordinator};
pub use events::{LocalEvent, LocalEventSender};
pub use locks::{LockHolder, LockOutcome, LockStatus, LockTracker, ResourceKey};
pub use managers::{
    Downstream, LogNotifier, Notice, NoticeLevel, NotesManager, Notifier, PlaybookManager,
    TerminalManager, VariableManager,
};
pub use store::{NotesScope, SessionId, SessionStore, StoreReader, TerminalSession};
