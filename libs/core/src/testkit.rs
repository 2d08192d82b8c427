//! Fakes and fixtures shared by the crate tests and downstream services.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::platforms::whatsapp::transport::{
    GraphResponse, GraphTransport, MediaUpload, TransportError,
};
use crate::types::{Gateway, GatewayState, ProviderCredentials};

pub const FIXTURE_SECRET: &str = "app-secret";

/// One call observed by [`RecordingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransportCall {
    pub method: &'static str,
    pub url: String,
    pub bearer: String,
    pub payload: Option<Value>,
    pub filename: Option<String>,
}

/// Transport that records every call and answers from a script.
///
/// Unscripted JSON posts succeed with a fresh `wamid.out.N` id, media uploads with
/// `media-N`. `GET`s answer from [`RecordingTransport::with_get`] or 404.
#[derive(Default)]
pub struct RecordingTransport {
    calls: Mutex<Vec<TransportCall>>,
    failures: Mutex<VecDeque<GraphResponse>>,
    gets: Mutex<HashMap<String, GraphResponse>>,
    counter: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_get(self, url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
        let body: Vec<u8> = body.into();
        self.gets
            .lock()
            .unwrap()
            .insert(url.into(), GraphResponse::new(status, body));
        self
    }

    /// Makes the next POST answer with `status` and `body`.
    pub fn fail_next(&self, status: u16, body: &str) {
        self.failures
            .lock()
            .unwrap()
            .push_back(GraphResponse::new(status, body.as_bytes().to_vec()));
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    fn next(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn scripted_failure(&self) -> Option<GraphResponse> {
        self.failures.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl GraphTransport for RecordingTransport {
    async fn get(&self, url: &str, bearer: &str) -> Result<GraphResponse, TransportError> {
        self.record(TransportCall {
            method: "GET",
            url: url.to_string(),
            bearer: bearer.to_string(),
            payload: None,
            filename: None,
        });
        let found = self.gets.lock().unwrap().get(url).cloned();
        Ok(found.unwrap_or_else(|| GraphResponse::new(404, "not found")))
    }

    async fn post_json(
        &self,
        url: &str,
        bearer: &str,
        payload: &Value,
    ) -> Result<GraphResponse, TransportError> {
        self.record(TransportCall {
            method: "POST",
            url: url.to_string(),
            bearer: bearer.to_string(),
            payload: Some(payload.clone()),
            filename: None,
        });
        if let Some(failure) = self.scripted_failure() {
            return Ok(failure);
        }
        let id = format!("wamid.out.{}", self.next());
        let body = json!({"messages": [{"id": id}]}).to_string();
        Ok(GraphResponse::new(200, body.into_bytes()))
    }

    async fn post_media(
        &self,
        url: &str,
        bearer: &str,
        upload: MediaUpload,
    ) -> Result<GraphResponse, TransportError> {
        self.record(TransportCall {
            method: "POST",
            url: url.to_string(),
            bearer: bearer.to_string(),
            payload: None,
            filename: Some(upload.filename),
        });
        if let Some(failure) = self.scripted_failure() {
            return Ok(failure);
        }
        let body = json!({"id": format!("media-{}", self.next())}).to_string();
        Ok(GraphResponse::new(200, body.into_bytes()))
    }
}

/// Integrated gateway used across tests; token `main`, secret [`FIXTURE_SECRET`].
pub fn fixture_gateway() -> Gateway {
    Gateway {
        id: "gw-main".into(),
        name: "Main line".into(),
        token: "main".into(),
        gateway_type: "whatsapp".into(),
        state: GatewayState::Integrated,
        webhook_secret: FIXTURE_SECRET.into(),
        verify_token: "verify-me".into(),
        credentials: ProviderCredentials {
            bearer_token: "graph-token".into(),
            api_version: "20.0".into(),
            from_phone: "1098765".into(),
        },
    }
}
