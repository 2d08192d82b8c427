//! WhatsApp Cloud API: webhook payloads, media, and outbound delivery.

pub mod media;
pub mod mimetypes;
pub mod sender;
pub mod transport;
pub mod webhook;

pub use media::{
    AudioTranscoder, FetchError, FetchedMedia, FfmpegTranscoder, GraphMediaFetcher, MediaFetcher,
    PassthroughTranscoder,
};
pub use mimetypes::MediaKind;
pub use sender::{DeliveryOutcome, OutboundSender, SendError, SendMode, TemplateDelivery};
pub use transport::{
    DEFAULT_API_BASE, GraphEndpoints, GraphResponse, GraphTransport, MediaUpload,
    ReqwestTransport, TransportError,
};
pub use webhook::{InboundMessage, ShapeError, WebhookPayload};
