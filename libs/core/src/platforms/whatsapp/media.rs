use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::transport::{GraphEndpoints, GraphTransport, TransportError};
use super::webhook::MediaRef;
use crate::types::ProviderCredentials;

const FALLBACK_MIMETYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("media info is not valid json")]
    Decode(#[from] serde_json::Error),
    #[error("audio conversion failed: {0}")]
    Transcode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    pub data: Vec<u8>,
    pub mimetype: String,
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Downloads a media reference; `Ok(None)` when it points nowhere.
    async fn fetch(
        &self,
        creds: &ProviderCredentials,
        media: &MediaRef,
    ) -> Result<Option<FetchedMedia>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct MediaInfo {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

/// Resolves media ids through the Graph API, then downloads the file.
pub struct GraphMediaFetcher {
    transport: Arc<dyn GraphTransport>,
    api_base: String,
}

impl GraphMediaFetcher {
    pub fn new(transport: Arc<dyn GraphTransport>, api_base: impl Into<String>) -> Self {
        Self {
            transport,
            api_base: api_base.into(),
        }
    }

    async fn get_ok(&self, url: &str, bearer: &str) -> Result<bytes::Bytes, FetchError> {
        let response = self.transport.get(url, bearer).await?;
        if !response.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status,
            });
        }
        Ok(response.body)
    }
}

#[async_trait]
impl MediaFetcher for GraphMediaFetcher {
    async fn fetch(
        &self,
        creds: &ProviderCredentials,
        media: &MediaRef,
    ) -> Result<Option<FetchedMedia>, FetchError> {
        let (url, mimetype) = match media.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => {
                let info_url = GraphEndpoints::new(&self.api_base, creds).object(id);
                let raw = self.get_ok(&info_url, &creds.bearer_token).await?;
                let info: MediaInfo = serde_json::from_slice(&raw)?;
                (info.url, info.mime_type.or_else(|| media.mime_type.clone()))
            }
            None => (media.url.clone(), media.mime_type.clone()),
        };
        let Some(url) = url.filter(|url| !url.is_empty()) else {
            debug!("media reference without download url");
            return Ok(None);
        };
        let data = self.get_ok(&url, &creds.bearer_token).await?;
        Ok(Some(FetchedMedia {
            data: data.to_vec(),
            mimetype: mimetype.unwrap_or_else(|| FALLBACK_MIMETYPE.to_string()),
        }))
    }
}

/// Converts received voice notes into a widely playable format.
#[async_trait]
pub trait AudioTranscoder: Send + Sync {
    async fn convert(&self, media: FetchedMedia) -> Result<FetchedMedia, FetchError>;
}

/// Keeps audio untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTranscoder;

#[async_trait]
impl AudioTranscoder for PassthroughTranscoder {
    async fn convert(&self, media: FetchedMedia) -> Result<FetchedMedia, FetchError> {
        Ok(media)
    }
}

/// Pipes audio through an `ffmpeg` binary and returns mp3.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: String,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl AudioTranscoder for FfmpegTranscoder {
    async fn convert(&self, media: FetchedMedia) -> Result<FetchedMedia, FetchError> {
        let mut child = Command::new(&self.binary)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-i",
                "pipe:0",
                "-f",
                "mp3",
                "pipe:1",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| FetchError::Transcode(err.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| FetchError::Transcode("ffmpeg stdin unavailable".into()))?;
        let input = media.data;
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| FetchError::Transcode(err.to_string()))?;
        writer
            .await
            .map_err(|err| FetchError::Transcode(err.to_string()))?
            .map_err(|err| FetchError::Transcode(err.to_string()))?;
        if !output.status.success() {
            return Err(FetchError::Transcode(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(FetchedMedia {
            data: output.stdout,
            mimetype: "audio/mpeg".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_keeps_bytes() {
        let media = FetchedMedia {
            data: vec![1, 2, 3],
            mimetype: "audio/ogg".into(),
        };
        let out = PassthroughTranscoder.convert(media.clone()).await.unwrap();
        assert_eq!(out, media);
    }

    #[tokio::test]
    async fn fetch_resolves_media_id_then_downloads() {
        let gateway = crate::testkit::fixture_gateway();
        let transport = crate::testkit::RecordingTransport::new()
            .with_get(
                "mock://graph/v20.0/media-9",
                200,
                r#"{"url":"mock://cdn/file-9","mime_type":"image/jpeg"}"#,
            )
            .with_get("mock://cdn/file-9", 200, b"JPEGDATA".to_vec());
        let transport = Arc::new(transport);
        let fetcher = GraphMediaFetcher::new(transport.clone(), "mock://graph");
        let media = MediaRef {
            id: Some("media-9".into()),
            ..MediaRef::default()
        };
        let fetched = fetcher
            .fetch(&gateway.credentials, &media)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.data, b"JPEGDATA");
        assert_eq!(fetched.mimetype, "image/jpeg");
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.bearer == "graph-token"));
    }

    #[tokio::test]
    async fn fetch_without_any_location_yields_nothing() {
        let gateway = crate::testkit::fixture_gateway();
        let transport = Arc::new(crate::testkit::RecordingTransport::new());
        let fetcher = GraphMediaFetcher::new(transport, "mock://graph");
        let fetched = fetcher
            .fetch(&gateway.credentials, &MediaRef::default())
            .await
            .unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn failed_download_is_a_status_error() {
        let gateway = crate::testkit::fixture_gateway();
        let transport = Arc::new(crate::testkit::RecordingTransport::new());
        let fetcher = GraphMediaFetcher::new(transport, "mock://graph");
        let media = MediaRef {
            url: Some("mock://cdn/missing".into()),
            ..MediaRef::default()
        };
        let err = fetcher
            .fetch(&gateway.credentials, &media)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn missing_ffmpeg_binary_is_a_transcode_error() {
        let media = FetchedMedia {
            data: vec![0; 4],
            mimetype: "audio/ogg".into(),
        };
        let err = FfmpegTranscoder::new("/nonexistent/ffmpeg-binary")
            .convert(media)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Transcode(_)));
    }
}
