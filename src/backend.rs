//! REST collaborator that persists variables and lists live terminals.

use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::sync::store::SessionId;
use crate::transport::protocol::{lenient_port, lenient_string};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, instrument};
use url::Url;

/// A terminal as reported by `terminals/list`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TerminalListing {
    #[serde(default, deserialize_with = "lenient_port")]
    pub port: Option<u16>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn list_terminals(&self) -> SyncResult<Vec<TerminalListing>>;

    async fn create_variable(&self, session: &SessionId, name: &str, value: &str) -> SyncResult<()>;

    async fn update_variable(&self, session: &SessionId, name: &str, value: &str) -> SyncResult<()>;

    async fn delete_variable(&self, session: &SessionId, name: &str) -> SyncResult<()>;

    async fn load_variables(&self, session: &SessionId) -> SyncResult<BTreeMap<String, String>>;
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    terminals: Option<Vec<TerminalListing>>,
    #[serde(default)]
    variables: Option<Map<String, Value>>,
}

impl ApiResponse {
    fn into_checked(self, what: &str) -> SyncResult<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(SyncError::Backend(format!(
                "{} failed: {}",
                what,
                self.error.as_deref().unwrap_or("no error message")
            )))
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    base: Url,
}

impl BackendClient {
    pub fn new(config: &Config) -> SyncResult<Self> {
        let http = Client::builder().timeout(config.http_timeout).build()?;
        let base = Url::parse(&config.api_base_url)?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base.join(path)?)
    }

    async fn read(response: Response, what: &str) -> SyncResult<ApiResponse> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Backend(format!("{} returned {}: {}", what, status, body.trim())));
        }
        let body: ApiResponse = response.json().await?;
        body.into_checked(what)
    }

    async fn post(&self, path: &str, body: Value, what: &str) -> SyncResult<()> {
        let url = self.endpoint(path)?;
        debug!(url = %url, "POST");
        let response = self.http.post(url).json(&body).send().await?;
        Self::read(response, what).await.map(|_| ())
    }
}

#[async_trait]
impl Backend for BackendClient {
    #[instrument(skip(self))]
    async fn list_terminals(&self) -> SyncResult<Vec<TerminalListing>> {
        let url = self.endpoint("terminals/list")?;
        let response = self.http.get(url).send().await?;
        let envelope = Self::read(response, "terminals/list").await?;
        Ok(envelope.terminals.unwrap_or_default())
    }

    async fn create_variable(&self, session: &SessionId, name: &str, value: &str) -> SyncResult<()> {
        self.post(
            &format!("variables/create/{}", session),
            json!({ "name": name, "value": value }),
            "variables/create",
        )
        .await
    }

    async fn update_variable(&self, session: &SessionId, name: &str, value: &str) -> SyncResult<()> {
        self.post(
            &format!("variables/update/{}", session),
            json!({ "oldName": name, "newName": name, "value": value }),
            "variables/update",
        )
        .await
    }

    async fn delete_variable(&self, session: &SessionId, name: &str) -> SyncResult<()> {
        self.post(
            &format!("variables/delete/{}", session),
            json!({ "name": name }),
            "variables/delete",
        )
        .await
    }

    #[instrument(skip(self), fields(session = %session))]
    async fn load_variables(&self, session: &SessionId) -> SyncResult<BTreeMap<String, String>> {
        let url = self.endpoint(&format!("variables/load/{}", session))?;
        let response = self.http.get(url).send().await?;
        let envelope = Self::read(response, "variables/load").await?;
        Ok(envelope
            .variables
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(name, value)| variable_value(value).map(|v| (name, v)))
            .collect())
    }
}

// Stored values are either bare strings or `{"value": ...}` records.
fn variable_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Object(mut record) => record.remove("value").and_then(variable_value),
        Value::Null | Value::Array(_) => None,
    }
}
