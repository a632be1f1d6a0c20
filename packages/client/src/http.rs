//! Queue server REST gateway binding.

use std::time::Duration;

use queue_core::{PlanDefinition, PlanKind, PlanParameter, ServerStatus};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::{
    CommandResponse, HistoryListing, QueueListing, QueueServer, RemoteError, RemoteFuture,
    RemoteResult,
};

/// [`QueueServer`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpQueueServer {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpQueueServer {
    /// Create a client for the gateway at `base_url`; every request gives up
    /// after `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        })
    }

    /// Send `Authorization: ApiKey <key>` with every request.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.is_empty());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> RemoteResult<T> {
        self.send(self.client.get(self.url(path))).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> RemoteResult<T> {
        self.send(self.client.post(self.url(path)).json(&body)).await
    }

    /// POST a command whose only interesting answer is success or failure.
    async fn post_command(&self, path: &str, body: Value) -> RemoteResult<()> {
        let response: CommandResponse = self.post(path, body).await?;
        response.into_result().map(|_| ())
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> RemoteResult<T> {
        let request = match &self.api_key {
            Some(key) => request.header("Authorization", format!("ApiKey {}", key)),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

impl QueueServer for HttpQueueServer {
    fn endpoint(&self) -> &str {
        &self.base_url
    }

    fn status(&self) -> RemoteFuture<'_, ServerStatus> {
        Box::pin(self.get("/api/status"))
    }

    fn fetch_queue(&self) -> RemoteFuture<'_, QueueListing> {
        Box::pin(self.get("/api/queue/get"))
    }

    fn fetch_history(&self) -> RemoteFuture<'_, HistoryListing> {
        Box::pin(self.get("/api/history/get"))
    }

    fn update_item(&self, item: Value, replace: bool) -> RemoteFuture<'_, CommandResponse> {
        Box::pin(self.post(
            "/api/queue/item/update",
            json!({"item": item, "replace": replace}),
        ))
    }

    fn move_item(&self, uid: String, destination: usize) -> RemoteFuture<'_, CommandResponse> {
        Box::pin(self.post(
            "/api/queue/item/move",
            json!({"uid": uid, "pos_dest": destination}),
        ))
    }

    fn remove_items(&self, uids: Vec<String>) -> RemoteFuture<'_, ()> {
        Box::pin(self.post_command("/api/queue/item/remove/batch", json!({"uids": uids})))
    }

    fn duplicate_items(&self, uids: Vec<String>) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            let queue: QueueListing = self.get("/api/queue/get").await?;
            let history: HistoryListing = self.get("/api/history/get").await?;
            let items = copies_of(&uids, queue.items.iter().chain(history.items.iter()));
            if items.is_empty() {
                return Ok(());
            }
            self.post_command(
                "/api/queue/item/add/batch",
                json!({"items": items, "pos": "front"}),
            )
            .await
        })
    }

    fn clear_queue(&self) -> RemoteFuture<'_, ()> {
        Box::pin(self.post_command("/api/queue/clear", json!({})))
    }

    fn clear_history(&self) -> RemoteFuture<'_, ()> {
        Box::pin(self.post_command("/api/history/clear", json!({})))
    }

    fn start_queue(&self) -> RemoteFuture<'_, CommandResponse> {
        Box::pin(self.post("/api/queue/start", json!({})))
    }

    fn stop_queue(&self) -> RemoteFuture<'_, CommandResponse> {
        Box::pin(self.post("/api/queue/stop", json!({})))
    }

    fn allowed_definitions(&self, kind: PlanKind) -> RemoteFuture<'_, Vec<PlanDefinition>> {
        Box::pin(async move {
            let path = match kind {
                PlanKind::Plan => "/api/plans/allowed",
                PlanKind::Instruction => "/api/instructions/allowed",
            };
            let body: Value = self.get(path).await?;
            Ok(parse_allowed(kind, &body))
        })
    }
}

/// Submittable copies of the items with the given uids, in `uids` order.
///
/// Server-assigned fields are dropped so the server issues fresh uids.
pub(crate) fn copies_of<'a>(
    uids: &[String],
    items: impl Iterator<Item = &'a Value> + Clone,
) -> Vec<Value> {
    uids.iter()
        .filter_map(|uid| {
            items.clone().find(|item| {
                queue_core::QueueRecord::from_value((*item).clone()).uid().as_deref()
                    == Some(uid.as_str())
            })
        })
        .filter_map(|item| {
            let mut copy = item.as_object()?.clone();
            for key in ["item_uid", "result", "status", "exit_status"] {
                copy.shift_remove(key);
            }
            Some(Value::Object(copy))
        })
        .collect()
}

/// Parse a `plans/allowed` or `instructions/allowed` response.
pub(crate) fn parse_allowed(kind: PlanKind, body: &Value) -> Vec<PlanDefinition> {
    let key = match kind {
        PlanKind::Plan => "plans_allowed",
        PlanKind::Instruction => "instructions_allowed",
    };
    let Some(entries) = body.get(key).and_then(Value::as_object) else {
        return Vec::new();
    };

    entries
        .iter()
        .map(|(name, entry)| {
            let mut definition = PlanDefinition::new(name.clone(), kind);
            definition.description = entry
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string);
            definition.parameters = entry
                .get("parameters")
                .and_then(Value::as_array)
                .map(|params| params.iter().filter_map(parse_parameter).collect())
                .unwrap_or_default();
            definition
        })
        .collect()
}

fn parse_parameter(entry: &Value) -> Option<PlanParameter> {
    let name = entry.get("name")?.as_str()?;
    let default = entry.get("default");
    let mut parameter = PlanParameter::new(name)
        .with_default(default.map(parse_default).unwrap_or(Value::Null))
        .with_required(default.is_none());
    if let Some(type_name) = entry
        .get("annotation")
        .and_then(|annotation| annotation.get("type"))
        .and_then(Value::as_str)
    {
        parameter = parameter.with_type_name(type_name);
    }
    if let Some(description) = entry.get("description").and_then(Value::as_str) {
        parameter = parameter.with_description(description);
    }
    Some(parameter)
}

/// Defaults arrive as source text: JSON literals are parsed, single-quoted
/// strings are unquoted, anything else stays text.
fn parse_default(default: &Value) -> Value {
    let Some(text) = default.as_str() else {
        return default.clone();
    };
    let trimmed = text.trim();
    if let Some(inner) = trimmed
        .strip_prefix('\'')
        .and_then(|rest| rest.strip_suffix('\''))
    {
        return Value::String(inner.to_string());
    }
    match trimmed {
        "None" => Value::Null,
        "True" => Value::Bool(true),
        "False" => Value::Bool(false),
        _ => serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(text.to_string())),
    }
}
