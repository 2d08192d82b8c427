pub const WEBHOOK_UPDATES: &str = "webhook_updates_total";
pub const MESSAGES_PERSISTED: &str = "inbound_messages_persisted_total";
pub const DELIVERY_ATTEMPTS: &str = "delivery_attempts_total";

pub fn record_update_outcome(outcome: &'static str) {
    metrics::counter!(WEBHOOK_UPDATES, "outcome" => outcome).increment(1);
}

pub fn record_persisted(count: usize) {
    metrics::counter!(MESSAGES_PERSISTED).increment(count as u64);
}

pub fn record_delivery_attempt(status: &'static str) {
    metrics::counter!(DELIVERY_ATTEMPTS, "status" => status).increment(1);
}
