//! Turns one provider message into the `{body, attachments}` pair that gets stored.

use std::sync::Arc;

use gwb_core::Attachment;
use gwb_core::ProviderCredentials;
use gwb_core::platforms::whatsapp::mimetypes::extension_for;
use gwb_core::platforms::whatsapp::webhook::{MEDIA_KINDS, MediaRef};
use gwb_core::platforms::whatsapp::{
    AudioTranscoder, FetchError, InboundMessage, MediaFetcher, PassthroughTranscoder,
};
use gwb_core::text::location_link;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub body: String,
    pub attachments: Vec<Attachment>,
}

impl Normalized {
    pub fn is_empty(&self) -> bool {
        self.body.is_empty() && self.attachments.is_empty()
    }
}

#[derive(Debug, Error)]
#[error("media slot `{kind}` could not be fetched: {source}")]
pub struct MediaFailure {
    pub kind: &'static str,
    #[source]
    pub source: FetchError,
}

/// Media retrieval failed; `partial` holds everything that could be normalized.
#[derive(Debug, Error)]
#[error("{} media slot(s) of message {message_id} failed", failures.len())]
pub struct NormalizeError {
    pub message_id: String,
    pub failures: Vec<MediaFailure>,
    pub partial: Normalized,
}

pub struct Normalizer {
    fetcher: Arc<dyn MediaFetcher>,
    transcoder: Arc<dyn AudioTranscoder>,
}

impl Normalizer {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, transcoder: Arc<dyn AudioTranscoder>) -> Self {
        Self {
            fetcher,
            transcoder,
        }
    }

    /// Normalizer that keeps voice notes in the provider codec.
    pub fn without_transcoding(fetcher: Arc<dyn MediaFetcher>) -> Self {
        Self::new(fetcher, Arc::new(PassthroughTranscoder))
    }

    pub async fn normalize(
        &self,
        creds: &ProviderCredentials,
        message: &InboundMessage,
    ) -> Result<Normalized, NormalizeError> {
        let mut normalized = Normalized {
            body: message_body(message),
            attachments: Vec::new(),
        };
        let mut failures = Vec::new();

        for kind in MEDIA_KINDS {
            let Some(media) = message.media(kind) else {
                continue;
            };
            match self.attachment(creds, kind, media).await {
                Ok(Some(attachment)) => normalized.attachments.push(attachment),
                Ok(None) => debug!(kind, "media slot without location skipped"),
                Err(source) => {
                    warn!(kind, error = %source, msg_id = %message.id, "media fetch failed");
                    failures.push(MediaFailure { kind, source });
                }
            }
        }

        if let Some(location) = &message.location {
            normalized
                .body
                .push_str(&location_link(location.latitude, location.longitude));
        }

        if failures.is_empty() {
            Ok(normalized)
        } else {
            Err(NormalizeError {
                message_id: message.id.clone(),
                failures,
                partial: normalized,
            })
        }
    }

    async fn attachment(
        &self,
        creds: &ProviderCredentials,
        kind: &'static str,
        media: &MediaRef,
    ) -> Result<Option<Attachment>, FetchError> {
        let Some(mut fetched) = self.fetcher.fetch(creds, media).await? else {
            return Ok(None);
        };
        if kind == "audio" {
            fetched = self.transcoder.convert(fetched).await?;
        }
        let stem = media.id.as_deref().unwrap_or(kind);
        let filename = format!("{stem}{}", extension_for(&fetched.mimetype).unwrap_or_default());
        Ok(Some(Attachment {
            filename,
            mimetype: fetched.mimetype,
            data: fetched.data,
        }))
    }
}

/// Text carried by the message itself; `contacts` cards carry none.
fn message_body(message: &InboundMessage) -> String {
    if message.is_button() {
        return message.button_text().unwrap_or_default().to_string();
    }
    message
        .text
        .as_ref()
        .map(|text| text.body.clone())
        .unwrap_or_default()
}
