//! Backend client for `POST /api/messages/sync`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use nexfi_shared::constants::SYNC_PATH;
use nexfi_shared::protocol::{SyncRequest, SyncResponse};

use crate::error::{Result, SyncError};

/// Header carrying the client message id so the backend can collapse retries.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Submit one message. Non-2xx statuses are errors; the decoded body is
    /// returned as-is for the caller to judge.
    async fn push(&self, request: &SyncRequest) -> Result<SyncResponse>;
}

/// [`SyncBackend`] over HTTP with `reqwest`.
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), SYNC_PATH),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SyncBackend for HttpBackend {
    async fn push(&self, request: &SyncRequest) -> Result<SyncResponse> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header(IDEMPOTENCY_HEADER, &request.local_id)
            .json(request);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::Status(status.as_u16()));
        }

        let body = resp.json::<SyncResponse>().await?;
        debug!(msg_id = %request.local_id, success = body.success, "sync response");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::*;

    fn request() -> SyncRequest {
        SyncRequest {
            from_user_id: "7".into(),
            to_user_id: "9".into(),
            text: "hello".into(),
            image: None,
            voice: None,
            mood: Some("calm".into()),
            local_id: "m-1".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    /// Serve exactly one HTTP exchange with a canned response and hand back
    /// the raw request.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + length {
                        break;
                    }
                }
            }

            let response = format!(
                "{status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&raw).to_string());
        });

        (format!("http://{addr}/"), rx)
    }

    #[test]
    fn endpoint_joins_base_url() {
        let backend =
            HttpBackend::new("http://localhost:5000/", Duration::from_secs(1), None).unwrap();
        assert_eq!(backend.endpoint(), "http://localhost:5000/api/messages/sync");
    }

    #[tokio::test]
    async fn posts_body_with_idempotency_key_and_token() {
        let (base, captured) =
            serve_once("HTTP/1.1 200 OK", r#"{"success":true,"message_id":42}"#).await;
        let backend =
            HttpBackend::new(&base, Duration::from_secs(5), Some("secret".into())).unwrap();

        let resp = backend.push(&request()).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.message_id.as_deref(), Some("42"));

        let raw = captured.await.unwrap();
        let lower = raw.to_ascii_lowercase();
        assert!(raw.starts_with("POST /api/messages/sync "));
        assert!(lower.contains("idempotency-key: m-1"));
        assert!(lower.contains("authorization: bearer secret"));

        let body_start = raw.find("\r\n\r\n").unwrap() + 4;
        let body: serde_json::Value = serde_json::from_str(&raw[body_start..]).unwrap();
        assert_eq!(body["local_id"], "m-1");
        assert_eq!(body["from_user_id"], "7");
        assert_eq!(body["mood"], "calm");
        assert!(body["image"].is_null());
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let (base, _captured) =
            serve_once("HTTP/1.1 500 Internal Server Error", r#"{"error":"boom"}"#).await;
        let backend = HttpBackend::new(&base, Duration::from_secs(5), None).unwrap();

        let err = backend.push(&request()).await.unwrap_err();
        assert!(matches!(err, SyncError::Status(500)));
    }
}
