use std::time::Duration;

use async_trait::async_trait;
use pricewise_core::signals::{sign_payload, SignalError, SIGNATURE_HEADER};
use pricewise_core::{Signal, SignalSink};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

/// POSTs each signal as JSON, signed with a hex HMAC-SHA256 of the body.
pub struct WebhookSignalSink {
    client: Client,
    url: String,
    secret: SecretString,
}

impl WebhookSignalSink {
    pub fn new(
        url: impl Into<String>,
        secret: SecretString,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { client, url: url.into(), secret })
    }
}

#[async_trait]
impl SignalSink for WebhookSignalSink {
    async fn deliver(&self, signal: &Signal) -> Result<(), SignalError> {
        let body =
            serde_json::to_vec(signal).map_err(|error| SignalError::Encoding(error.to_string()))?;
        let signature = sign_payload(self.secret.expose_secret().as_bytes(), &body)?;

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await
            .map_err(|error| SignalError::Delivery(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SignalError::Rejected { status: status.as_u16() });
        }

        debug!(
            event_name = "signals.webhook.accepted",
            signal_id = %signal.id,
            status = status.as_u16(),
            "webhook accepted signal"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use pricewise_core::signals::{sign_payload, SignalError, SIGNATURE_HEADER};
    use pricewise_core::{ExperimentId, Signal, SignalKind, SignalSink, TenantId};
    use rust_decimal::Decimal;
    use secrecy::SecretString;
    use tokio::sync::Mutex;

    use super::WebhookSignalSink;

    #[derive(Clone, Default)]
    struct Captured {
        requests: Arc<Mutex<Vec<(Option<String>, Vec<u8>)>>>,
    }

    async fn receive(
        State(captured): State<Captured>,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        let signature =
            headers.get(SIGNATURE_HEADER).and_then(|value| value.to_str().ok()).map(str::to_string);
        captured.requests.lock().await.push((signature, body.to_vec()));
        StatusCode::ACCEPTED
    }

    async fn spawn_receiver(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        format!("http://{address}/hook")
    }

    fn signal() -> Signal {
        Signal::new(
            SignalKind::ConversionRecorded,
            TenantId("tenant-1".to_string()),
            ExperimentId("exp-1".to_string()),
            "user-1",
            "control",
            Decimal::new(2999, 2),
            Some(Decimal::new(2999, 2)),
        )
    }

    #[tokio::test]
    async fn delivers_signed_json_body() {
        let captured = Captured::default();
        let url = spawn_receiver(
            Router::new().route("/hook", post(receive)).with_state(captured.clone()),
        )
        .await;
        let sink = WebhookSignalSink::new(
            url,
            SecretString::from("whsec-test".to_string()),
            Duration::from_secs(5),
        )
        .expect("client");

        let sent = signal();
        sink.deliver(&sent).await.expect("deliver");

        let requests = captured.requests.lock().await;
        assert_eq!(requests.len(), 1);
        let (signature, body) = &requests[0];
        let expected = sign_payload(b"whsec-test", body).expect("sign");
        assert_eq!(signature.as_deref(), Some(expected.as_str()));

        let decoded: Signal = serde_json::from_slice(body).expect("signal json");
        assert_eq!(decoded, sent);
    }

    #[tokio::test]
    async fn non_success_status_is_a_rejection() {
        let url = spawn_receiver(
            Router::new().route("/hook", post(|| async { StatusCode::SERVICE_UNAVAILABLE })),
        )
        .await;
        let sink = WebhookSignalSink::new(
            url,
            SecretString::from("whsec-test".to_string()),
            Duration::from_secs(5),
        )
        .expect("client");

        let error = sink.deliver(&signal()).await.unwrap_err();

        assert_eq!(error, SignalError::Rejected { status: 503 });
    }
}
