use anyhow::{Context, Result};
use echo_backend::config::EchoConfig;
use echo_backend::proactive::candidate::Candidate;
use echo_backend::proactive::EngineStatus;
use flume::Sender;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header as ws_header;
use tokio_tungstenite::tungstenite::http::HeaderValue as WsHeaderValue;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Clone, PartialEq)]
pub enum FrontendEvent {
    ProactiveMessage(Candidate),
    CandidateDismissed { id: String },
}

#[derive(Debug, Deserialize)]
struct ApiEventEnvelope {
    event_type: String,
    payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForceResponse {
    pub accepted: bool,
    pub candidate_id: String,
    pub emitted: Option<Candidate>,
    pub cooldown_remaining_secs: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DismissResponse {
    dismissed: bool,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn from_env() -> Self {
        let base = std::env::var("ECHO_BACKEND_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8787".to_string());
        let token = std::env::var("ECHO_BACKEND_TOKEN")
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self::new(base, token)
    }

    pub fn new(base_url: String, token: Option<String>) -> Self {
        let normalized_base = normalize_base_url(&base_url);
        let ws_url = normalize_ws_url(&normalized_base);

        Self {
            http: reqwest::Client::new(),
            base_url: normalized_base,
            ws_url,
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    pub async fn get_config(&self) -> Result<EchoConfig> {
        self.request(reqwest::Method::GET, "/v1/config")
            .send()
            .await?
            .error_for_status()
            .context("GET /v1/config failed")?
            .json::<EchoConfig>()
            .await
            .context("Failed to decode config response")
    }

    pub async fn pending_candidates(&self) -> Result<Vec<Candidate>> {
        let response = self
            .request(reqwest::Method::GET, "/v1/proactive/pending")
            .send()
            .await?
            .error_for_status()
            .context("GET /v1/proactive/pending failed")?;
        let body = response
            .text()
            .await
            .context("Failed to read pending candidate payload")?;
        serde_json::from_str::<Vec<Candidate>>(&body).context(format!(
            "Failed to decode pending candidates. Payload preview: {}",
            body.chars().take(500).collect::<String>()
        ))
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        self.request(reqwest::Method::GET, "/v1/proactive/status")
            .send()
            .await?
            .error_for_status()
            .context("GET /v1/proactive/status failed")?
            .json::<EngineStatus>()
            .await
            .context("Failed to decode engine status")
    }

    pub async fn force(&self, category: &str) -> Result<ForceResponse> {
        #[derive(Serialize)]
        struct ForceRequest<'a> {
            category: &'a str,
        }

        self.request(reqwest::Method::POST, "/v1/proactive/force")
            .json(&ForceRequest { category })
            .send()
            .await?
            .error_for_status()
            .context("POST /v1/proactive/force failed")?
            .json::<ForceResponse>()
            .await
            .context("Failed to decode force response")
    }

    pub async fn dismiss(&self, candidate_id: &str) -> Result<bool> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/v1/proactive/{}/dismiss", candidate_id),
            )
            .send()
            .await?
            .error_for_status()
            .context("POST dismiss failed")?
            .json::<DismissResponse>()
            .await
            .context("Failed to decode dismiss response")?;
        Ok(response.dismissed)
    }

    pub async fn respond(&self, candidate_id: &str, text: &str) -> Result<bool> {
        #[derive(Serialize)]
        struct RespondRequest<'a> {
            text: &'a str,
        }

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/v1/proactive/{}/respond", candidate_id),
            )
            .json(&RespondRequest { text })
            .send()
            .await?
            .error_for_status()
            .context("POST respond failed")?
            .json::<DismissResponse>()
            .await
            .context("Failed to decode respond response")?;
        Ok(response.dismissed)
    }

    pub async fn record_interaction(&self, summary: &str) -> Result<()> {
        #[derive(Serialize)]
        struct InteractionRequest<'a> {
            summary: &'a str,
        }

        self.request(reqwest::Method::POST, "/v1/interactions")
            .json(&InteractionRequest { summary })
            .send()
            .await?
            .error_for_status()
            .context("POST /v1/interactions failed")?;
        Ok(())
    }

    pub async fn stream_events_forever(self, tx: Sender<FrontendEvent>) {
        loop {
            match self.stream_events_once(&tx).await {
                Ok(()) => {
                    tracing::info!("Event stream disconnected; reconnecting in 2s");
                }
                Err(error) => {
                    tracing::warn!("Event stream failed: {}; reconnecting in 2s", error);
                }
            }
            if tx.is_disconnected() {
                break;
            }
            sleep(Duration::from_secs(2)).await;
        }
    }

    async fn stream_events_once(&self, tx: &Sender<FrontendEvent>) -> Result<()> {
        let ws_endpoint = format!("{}/v1/ws/events", self.ws_url);
        let mut request = ws_endpoint
            .into_client_request()
            .context("Invalid websocket endpoint URL")?;

        if let Some(token) = self.token.as_deref() {
            let value = WsHeaderValue::from_str(&format!("Bearer {}", token))
                .context("Invalid bearer token for websocket auth")?;
            request
                .headers_mut()
                .insert(ws_header::AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request)
            .await
            .context("Failed to connect websocket event stream")?;
        let (_write, mut read) = stream.split();

        while let Some(message) = read.next().await {
            let text = match message.context("Websocket read error")? {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Close(_) => return Ok(()),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };
            match parse_event_envelope(&text) {
                Ok(Some(event)) => {
                    if tx.send(event).is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(error) => tracing::debug!("Skipping undecodable event: {}", error),
            }
        }

        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(token) = self.token.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

fn parse_event_envelope(text: &str) -> Result<Option<FrontendEvent>> {
    let envelope: ApiEventEnvelope =
        serde_json::from_str(text).context("Failed to decode API event envelope")?;
    map_event(envelope)
}

fn map_event(envelope: ApiEventEnvelope) -> Result<Option<FrontendEvent>> {
    match envelope.event_type.as_str() {
        "proactive_message" => {
            let candidate = serde_json::from_value::<Candidate>(envelope.payload)
                .context("Failed to decode proactive message payload")?;
            Ok(Some(FrontendEvent::ProactiveMessage(candidate)))
        }
        "candidate_dismissed" => Ok(Some(FrontendEvent::CandidateDismissed {
            id: envelope
                .payload
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })),
        _ => Ok(None),
    }
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "http://127.0.0.1:8787".to_string()
    } else {
        trimmed.to_string()
    }
}

fn normalize_ws_url(base_http_url: &str) -> String {
    if let Some(rest) = base_http_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_http_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base_http_url)
    }
}
