//! `Http` node handler: one synchronous HTTP call per node execution.
//!
//! Params:
//! - `url` (required)
//! - `method` (default `GET`)
//! - `headers` (object of string values)
//! - `body` (string sent as-is, anything else sent as JSON)
//!
//! Output is `{status, body}` where `body` is parsed as JSON when possible.
//! Non-2xx responses and transport errors fail the node.

use std::time::Duration;

use dagflow_core::workflow::runner::{NodeContext, NodeHandler, NodeOutcome};
use dagflow_types::definition::NodeType;
use dagflow_types::error::EngineError;
use serde_json::{Value, json};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpHandler {
    client: reqwest::Client,
}

impl HttpHandler {
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dagflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl NodeHandler for HttpHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Http
    }

    async fn execute(&self, ctx: &NodeContext) -> Result<NodeOutcome, EngineError> {
        let Some(url) = ctx.params.get("url").and_then(Value::as_str) else {
            return Ok(NodeOutcome::Failed("http node needs params.url".to_string()));
        };
        let method = ctx
            .params
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");
        let Ok(method) = method.to_uppercase().parse::<reqwest::Method>() else {
            return Ok(NodeOutcome::Failed(format!("invalid HTTP method: {method}")));
        };

        let mut request = self.client.request(method.clone(), url);
        if let Some(headers) = ctx.params.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key.as_str(), value);
                }
            }
        }
        request = match ctx.params.get("body") {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request.body(text.clone()),
            Some(other) => request.json(other),
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    node_inst_id = ctx.node_inst_id,
                    url,
                    error = %e,
                    "http node request failed"
                );
                return Ok(NodeOutcome::Failed(format!("request to {url} failed: {e}")));
            }
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return Ok(NodeOutcome::Failed(format!("reading response body failed: {e}"))),
        };
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        tracing::debug!(
            node_inst_id = ctx.node_inst_id,
            %method,
            url,
            status = status.as_u16(),
            "http node completed"
        );

        if status.is_success() {
            Ok(NodeOutcome::Completed(json!({
                "status": status.as_u16(),
                "body": body,
            })))
        } else {
            Ok(NodeOutcome::Failed(format!("{method} {url} returned {status}")))
        }
    }
}
