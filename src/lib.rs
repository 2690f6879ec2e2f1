//! Real-time synchronization layer for CommandWave workspaces.
//!
//! A [`transport::TransportChannel`] carries JSON frames to and from the
//! collaboration server, a [`sync::SyncCoordinator`] applies remote changes to
//! the shared [`sync::SessionStore`] and debounces local edits on the way out,
//! and a [`sync::LockTracker`] requests advisory editing locks.

pub mod backend;
pub mod config;
pub mod error;
pub mod sync;
pub mod transport;
pub mod utils;

pub use backend::{Backend, BackendClient};
pub use config::{Config, ReconnectPolicy};
pub use error::{SyncError, SyncResult};
