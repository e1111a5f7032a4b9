//! Outbound webhook delivery (§6 "Outbound (core to caller)").

use common::VerificationRecord;
use serde::Serialize;
use tracing::warn;

/// `{request_id, total, results}`, per §6.
#[derive(Debug, Serialize)]
pub struct WebhookPayload<'a> {
    pub request_id: &'a str,
    pub total: usize,
    pub results: &'a [VerificationRecord],
}

/// POSTs `payload` to `url`. Returns `true` on any 2xx response, `false`
/// on a non-2xx response or a transport-level failure — both count as an
/// attempt against the caller's retry budget (§4.2 "Webhook failure").
pub async fn send_webhook(client: &reqwest::Client, url: &str, payload: &WebhookPayload<'_>) -> bool {
    match client.post(url).json(payload).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            warn!(%url, error = %e, "webhook delivery failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_serializes_with_spec_shape() {
        let results = vec![];
        let payload = WebhookPayload { request_id: "r1", total: 0, results: &results };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["request_id"], "r1");
        assert_eq!(json["total"], 0);
        assert!(json["results"].as_array().unwrap().is_empty());
    }
}
