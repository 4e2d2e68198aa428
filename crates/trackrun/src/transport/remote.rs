// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::TransportError;
use crate::transport::{AlertState, CreatedRun, Payload, RecordKind, Transport};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Response};
use serde_json::{json, Value};
use std::error::Error;
use std::time::Duration;
use tracing::{debug, error};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds a reqwest client with optional proxy configuration and timeout.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}

/// HTTP client for the tracking service REST API
#[derive(Clone)]
pub struct RemoteTransport {
    url: String,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl RemoteTransport {
    pub fn new(
        url: &str,
        token: &str,
        https_proxy: Option<&str>,
    ) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| TransportError::Serialization(format!("invalid token header: {e}")))?;
        headers.insert(AUTHORIZATION, bearer);

        let client = build_client(https_proxy, REQUEST_TIMEOUT).unwrap_or_else(|e| {
            error!(
                "Unable to parse proxy configuration: {}, no proxy will be used",
                e
            );
            reqwest::Client::new()
        });

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            headers,
            client,
        })
    }

    fn endpoint(kind: RecordKind) -> (Method, &'static str) {
        match kind {
            RecordKind::Metrics => (Method::POST, "/api/metrics"),
            RecordKind::Event => (Method::POST, "/api/events"),
            RecordKind::Update => (Method::PUT, "/api/runs"),
            RecordKind::Folder => (Method::PUT, "/api/folders"),
            RecordKind::Alert => (Method::POST, "/api/alerts"),
            RecordKind::File => (Method::POST, "/api/data"),
        }
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.url))
            .headers(self.headers.clone())
    }

    /// Turns any non-2xx response into a [`TransportError::Status`].
    async fn check(response: Response) -> Result<Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn json_body(response: Response) -> Result<Option<Value>, TransportError> {
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_slice(&bytes).ok())
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    async fn create_run(&self, data: &Value) -> Result<CreatedRun, TransportError> {
        let response = self
            .request(Method::POST, "/api/runs")
            .json(data)
            .send()
            .await?;
        let body = Self::json_body(Self::check(response).await?).await?;
        let body = body.unwrap_or(Value::Null);
        let created = CreatedRun {
            name: body.get("name").and_then(Value::as_str).map(str::to_string),
            id: body.get("id").and_then(Value::as_str).map(str::to_string),
        };
        debug!("Created run {:?} with id {:?}", created.name, created.id);
        Ok(created)
    }

    async fn heartbeat(&self, run: &str) -> Result<(), TransportError> {
        let response = self
            .request(Method::PUT, "/api/runs/heartbeat")
            .json(&json!({ "name": run }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn send(
        &self,
        kind: RecordKind,
        payload: &Payload,
    ) -> Result<Option<Value>, TransportError> {
        let (method, path) = Self::endpoint(kind);
        let request = self.request(method, path);
        let request = match payload {
            Payload::Binary(bytes) => request
                .header(CONTENT_TYPE, "application/msgpack")
                .body(bytes.clone()),
            Payload::Json(value) => request.json(value),
        };
        let response = Self::check(request.send().await?).await?;
        debug!("Sent {} record to {path}", kind.prefix());
        Self::json_body(response).await
    }

    async fn list_alerts(&self) -> Result<Vec<Value>, TransportError> {
        let response = self.request(Method::GET, "/api/alerts").send().await?;
        let body = Self::json_body(Self::check(response).await?).await?;
        match body {
            Some(Value::Array(alerts)) => Ok(alerts),
            Some(Value::Object(mut page)) => match page.remove("data") {
                Some(Value::Array(alerts)) => Ok(alerts),
                _ => Ok(Vec::new()),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn set_alert_state(
        &self,
        run: &str,
        alert: &str,
        state: AlertState,
    ) -> Result<(), TransportError> {
        let response = self
            .request(Method::PUT, "/api/alerts/status")
            .json(&json!({ "run": run, "alert": alert, "status": state.as_str() }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
