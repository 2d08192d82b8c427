use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use thiserror::Error;

use crate::types::ProviderCredentials;

pub const DEFAULT_API_BASE: &str = "https://graph.facebook.com";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("graph request failed")]
    Http(#[from] reqwest::Error),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Raw provider answer; status handling is left to the caller.
#[derive(Debug, Clone)]
pub struct GraphResponse {
    pub status: u16,
    pub body: Bytes,
}

impl GraphResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub filename: String,
    pub mimetype: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait GraphTransport: Send + Sync {
    async fn get(&self, url: &str, bearer: &str) -> Result<GraphResponse, TransportError>;
    async fn post_json(
        &self,
        url: &str,
        bearer: &str,
        payload: &Value,
    ) -> Result<GraphResponse, TransportError>;
    /// Multipart upload of one file to the media endpoint.
    async fn post_media(
        &self,
        url: &str,
        bearer: &str,
        upload: MediaUpload,
    ) -> Result<GraphResponse, TransportError>;
}

/// Graph endpoints for one set of credentials.
#[derive(Debug, Clone, Copy)]
pub struct GraphEndpoints<'a> {
    api_base: &'a str,
    creds: &'a ProviderCredentials,
}

impl<'a> GraphEndpoints<'a> {
    pub fn new(api_base: &'a str, creds: &'a ProviderCredentials) -> Self {
        Self { api_base, creds }
    }

    fn versioned(&self) -> String {
        format!(
            "{}/v{}",
            self.api_base.trim_end_matches('/'),
            self.creds.api_version.trim_start_matches('v')
        )
    }

    pub fn messages(&self) -> String {
        format!("{}/{}/messages", self.versioned(), self.creds.from_phone)
    }

    pub fn media(&self) -> String {
        format!("{}/{}/media", self.versioned(), self.creds.from_phone)
    }

    pub fn object(&self, id: &str) -> String {
        format!("{}/{}", self.versioned(), id)
    }
}

pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    async fn finish(response: reqwest::Response) -> Result<GraphResponse, TransportError> {
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        Ok(GraphResponse { status, body })
    }
}

#[async_trait]
impl GraphTransport for ReqwestTransport {
    async fn get(&self, url: &str, bearer: &str) -> Result<GraphResponse, TransportError> {
        let response = self.http.get(url).bearer_auth(bearer).send().await?;
        Self::finish(response).await
    }

    async fn post_json(
        &self,
        url: &str,
        bearer: &str,
        payload: &Value,
    ) -> Result<GraphResponse, TransportError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(bearer)
            .json(payload)
            .send()
            .await?;
        Self::finish(response).await
    }

    async fn post_media(
        &self,
        url: &str,
        bearer: &str,
        upload: MediaUpload,
    ) -> Result<GraphResponse, TransportError> {
        let part = Part::bytes(upload.data)
            .file_name(upload.filename)
            .mime_str(&upload.mimetype)?;
        let form = Form::new()
            .text("messaging_product", "whatsapp")
            .text("type", upload.mimetype.clone())
            .part("file", part);
        let response = self
            .http
            .post(url)
            .bearer_auth(bearer)
            .multipart(form)
            .send()
            .await?;
        Self::finish(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_use_configured_version_and_phone() {
        let creds = ProviderCredentials {
            bearer_token: "t".into(),
            api_version: "20.0".into(),
            from_phone: "1098765".into(),
        };
        let endpoints = GraphEndpoints::new("https://graph.facebook.com/", &creds);
        assert_eq!(
            endpoints.messages(),
            "https://graph.facebook.com/v20.0/1098765/messages"
        );
        assert_eq!(
            endpoints.media(),
            "https://graph.facebook.com/v20.0/1098765/media"
        );
        assert_eq!(
            endpoints.object("m-1"),
            "https://graph.facebook.com/v20.0/m-1"
        );
    }

    #[test]
    fn response_success_range() {
        assert!(GraphResponse::new(200, "{}").is_success());
        assert!(!GraphResponse::new(400, "bad").is_success());
    }
}
