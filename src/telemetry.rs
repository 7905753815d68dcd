//! Metric counters, compiled out unless the `metrics` feature is enabled.

use crate::types::WebhookId;

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    ::metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_webhook(name: &'static str, webhook_id: &WebhookId) {
    ::metrics::increment_counter!(name, "webhook" => webhook_id.to_string());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_webhook(_name: &'static str, _webhook_id: &WebhookId) {}
