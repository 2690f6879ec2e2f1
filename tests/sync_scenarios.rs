use async_trait::async_trait;
use commandwave_sync::backend::{Backend, TerminalListing};
use commandwave_sync::sync::{
    Downstream, LocalEvent, SessionId, StoreReader, SyncCoordinator, TerminalManager,
};
use commandwave_sync::transport::protocol::VariableAction;
use commandwave_sync::transport::{OutboundMessage, Transport};
use commandwave_sync::{Config, SyncResult};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::advance;

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingTransport {
    fn take(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    fn variable_updates(&self) -> Vec<OutboundMessage> {
        self.take()
            .into_iter()
            .filter(|m| matches!(m, OutboundMessage::VariableUpdated { .. }))
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, message: &OutboundMessage) -> bool {
        self.sent.lock().push(message.clone());
        true
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct StaticBackend {
    terminals: Vec<TerminalListing>,
    list_calls: Mutex<u32>,
}

#[async_trait]
impl Backend for StaticBackend {
    async fn list_terminals(&self) -> SyncResult<Vec<TerminalListing>> {
        *self.list_calls.lock() += 1;
        Ok(self.terminals.clone())
    }

    async fn create_variable(&self, _: &SessionId, _: &str, _: &str) -> SyncResult<()> {
        Ok(())
    }

    async fn update_variable(&self, _: &SessionId, _: &str, _: &str) -> SyncResult<()> {
        Ok(())
    }

    async fn delete_variable(&self, _: &SessionId, _: &str) -> SyncResult<()> {
        Ok(())
    }

    async fn load_variables(&self, session: &SessionId) -> SyncResult<BTreeMap<String, String>> {
        if session.as_str() == "9002" {
            return Ok(BTreeMap::from([("Host".to_string(), "10.0.0.9".to_string())]));
        }
        Ok(BTreeMap::new())
    }
}

#[derive(Clone, Default)]
struct Tabs(Arc<Mutex<Vec<(String, String)>>>);

impl TerminalManager for Tabs {
    fn add_remote_terminal(&mut self, id: &SessionId, _port: Option<u16>, name: &str) {
        self.0.lock().push((id.to_string(), name.to_string()));
    }
}

struct Client {
    transport: Arc<RecordingTransport>,
    backend: Arc<StaticBackend>,
    tabs: Tabs,
    store: StoreReader,
    handle: commandwave_sync::sync::CoordinatorHandle,
    task: JoinHandle<SyncCoordinator>,
}

impl Client {
    fn start(config: Config, backend: StaticBackend) -> Self {
        let transport = Arc::new(RecordingTransport::default());
        let backend = Arc::new(backend);
        let tabs = Tabs::default();
        let mut coordinator = SyncCoordinator::new(
            &config,
            transport.clone(),
            backend.clone(),
            Downstream::default().with_terminals(tabs.clone()),
        );
        let store = coordinator.store();
        let handle = coordinator.handle();
        let task = tokio::spawn(async move {
            coordinator.run().await;
            coordinator
        });
        Self {
            transport,
            backend,
            tabs,
            store,
            handle,
            task,
        }
    }

    fn remote(&self, event: &str, data: Value) {
        assert!(self.handle.deliver(event, &data), "{event} was not accepted");
    }

    fn local(&self, event: LocalEvent) {
        assert!(self.handle.local_events().publish(event));
    }

    async fn stop(self) -> SyncCoordinator {
        self.handle.shutdown();
        self.task.await.expect("coordinator task")
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn sid(raw: &str) -> SessionId {
    SessionId::from_wire(raw).expect("session id")
}

fn host_update(value: &str) -> LocalEvent {
    LocalEvent::VariableUpdated {
        terminal_id: sid("9001"),
        name: "Host".into(),
        value: value.into(),
    }
}

#[tokio::test(start_paused = true)]
async fn remote_terminal_creation_materializes_tab() {
    let client = Client::start(Config::default(), StaticBackend::default());
    client.remote(
        "terminal_created",
        json!({"terminal_id": "9001", "port": 9001, "name": "Recon"}),
    );
    settle().await;

    let session = client.store.session(&sid("9001")).expect("session 9001");
    assert_eq!(session.name, "Recon");
    assert!(session.variables.is_empty());
    assert!(session.playbooks.is_empty());
    assert_eq!(
        client.tabs.0.lock().as_slice(),
        [("9001".to_string(), "Recon".to_string())]
    );
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn typing_a_variable_sends_one_message_after_idle() {
    let client = Client::start(Config::default(), StaticBackend::default());
    client.local(LocalEvent::TerminalActivated {
        terminal_id: sid("9001"),
    });
    client.local(host_update("10.0.0"));
    settle().await;

    advance(Duration::from_millis(100)).await;
    client.local(host_update("10.0.0.5"));
    settle().await;

    // The second keystroke restarted the window.
    advance(Duration::from_millis(200)).await;
    settle().await;
    assert!(client.transport.variable_updates().is_empty());

    advance(Duration::from_millis(60)).await;
    settle().await;
    let sent = client.transport.variable_updates();
    assert_eq!(
        sent,
        vec![OutboundMessage::VariableUpdated {
            terminal_id: sid("9001"),
            name: "Host".into(),
            value: Some("10.0.0.5".into()),
            action: VariableAction::Update,
        }]
    );
    let wire: Value = serde_json::from_str(&sent[0].encode().expect("encode")).expect("json");
    assert_eq!(
        wire["data"],
        json!({"terminal_id": "9001", "name": "Host", "value": "10.0.0.5", "action": "update"})
    );
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn five_rapid_updates_coalesce_and_keys_stay_independent() {
    let client = Client::start(Config::default(), StaticBackend::default());
    for value in ["1", "10", "10.", "10.0", "10.0.0.5"] {
        client.local(host_update(value));
    }
    client.local(LocalEvent::VariableCreated {
        terminal_id: sid("9001"),
        name: "Port".into(),
        value: "22".into(),
    });
    settle().await;
    advance(Duration::from_millis(300)).await;
    settle().await;

    let sent = client.transport.variable_updates();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().any(|m| matches!(
        m,
        OutboundMessage::VariableUpdated { name, value: Some(v), .. } if name == "Host" && v == "10.0.0.5"
    )));
    assert!(sent.iter().any(|m| matches!(
        m,
        OutboundMessage::VariableUpdated { name, action: VariableAction::Create, .. } if name == "Port"
    )));
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_pending_edits() {
    let client = Client::start(Config::default(), StaticBackend::default());
    client.local(LocalEvent::GlobalNotesUpdated {
        content: "scope: 10.0.0.0/24".into(),
    });
    settle().await;
    let transport = client.transport.clone();
    client.stop().await;

    assert_eq!(
        transport.take(),
        vec![OutboundMessage::NotesUpdated {
            terminal_id: None,
            content: "scope: 10.0.0.0/24".into(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_catch_up_restores_missed_terminals() {
    let backend = StaticBackend {
        terminals: vec![
            TerminalListing {
                port: Some(9001),
                name: Some("Recon".into()),
            },
            TerminalListing {
                port: Some(9002),
                name: Some("Loot".into()),
            },
        ],
        ..Default::default()
    };
    let client = Client::start(Config::default(), backend);
    client.remote("terminal_created", json!({"port": 9001, "name": "Recon"}));
    client.remote("connection_lost", json!({}));
    client.remote("connection_established", json!({"reconnected": true}));
    settle().await;

    assert_eq!(client.store.session_ids(), vec![sid("9001"), sid("9002")]);
    assert_eq!(client.tabs.0.lock().len(), 2);
    // Persisted variables for the restored terminal are loaded eagerly.
    assert_eq!(client.store.variable(&sid("9002"), "Host").as_deref(), Some("10.0.0.9"));
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn periodic_reconciliation_pulls_terminal_list() {
    let config = Config {
        reconcile_interval: Some(Duration::from_secs(30)),
        ..Config::default()
    };
    let client = Client::start(config, StaticBackend::default());
    settle().await;
    assert_eq!(*client.backend.list_calls.lock(), 0);

    advance(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(*client.backend.list_calls.lock(), 1);
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn malformed_and_unknown_frames_are_dropped() {
    let client = Client::start(Config::default(), StaticBackend::default());
    assert!(!client
        .handle
        .deliver("notes_changed", &json!({"terminal_id": "9001", "content": 7})));
    assert!(!client.handle.deliver("pong", &json!({})));
    client.remote(
        "remote_variable_update",
        json!({"terminal_id": "9001", "name": "Host", "value": "x", "action": "merge"}),
    );
    settle().await;
    assert!(client.store.is_empty());
    assert!(client.transport.take().is_empty());
    client.stop().await;
}

#[tokio::test(start_paused = true)]
async fn remote_rename_leaves_pending_edits_on_schedule() {
    let client = Client::start(Config::default(), StaticBackend::default());
    client.remote("terminal_created", json!({"port": 9001, "name": "Recon"}));
    client.local(host_update("10.0.0.5"));
    settle().await;

    advance(Duration::from_millis(100)).await;
    client.remote("terminal_renamed", json!({"terminal_id": "9001", "name": "Loot"}));
    settle().await;
    assert_eq!(client.store.session(&sid("9001")).expect("session").name, "Loot");
    assert!(client.transport.variable_updates().is_empty());

    // The rename neither cancelled nor restarted the window.
    advance(Duration::from_millis(160)).await;
    settle().await;
    assert_eq!(client.transport.variable_updates().len(), 1);
    client.stop().await;
}
