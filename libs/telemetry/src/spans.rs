use tracing::{Span, info_span};

/// Span covering one webhook delivery.
pub fn start_update_span(usage: &str, gateway_token: &str) -> Span {
    info_span!("webhook.update", usage = %usage, gateway = %gateway_token, outcome = tracing::field::Empty)
}

/// Span covering one provider message inside a delivery.
pub fn start_message_span(channel_token: &str, provider_message_id: &str) -> Span {
    info_span!("webhook.message", channel = %channel_token, msg_id = %provider_message_id)
}
