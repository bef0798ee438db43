//! One remote generation-engine endpoint: HTTP session, persistent event
//! stream, authentication, and usage bookkeeping.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use base64::Engine as _;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AuthConfig, InstanceConfig};
use crate::error::{GatewayError, Result};

pub(crate) type EventStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Credentials and TLS policy for one instance.
#[derive(Debug, Clone, Default)]
pub struct EngineAuth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    pub ssl_verify: bool,
    pub ssl_cert: Option<PathBuf>,
}

impl From<&AuthConfig> for EngineAuth {
    fn from(config: &AuthConfig) -> Self {
        Self {
            username: config.username.clone(),
            password: config.password.clone(),
            api_key: config.api_key.clone(),
            ssl_verify: config.ssl_verify,
            ssl_cert: config.ssl_cert.as_ref().map(PathBuf::from),
        }
    }
}

impl EngineAuth {
    /// Authorization header value: api key takes precedence over basic auth.
    fn authorization(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            return Some(format!("Bearer {}", key));
        }
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", user, pass));
            return Some(format!("Basic {}", token));
        }
        None
    }
}

/// One remote engine endpoint in the pool.
pub struct EngineInstance {
    base_url: String,
    ws_url: String,
    weight: u32,
    auth: Option<EngineAuth>,
    /// Stable for the process lifetime; scopes the event stream server-side.
    client_id: String,
    timeout_secs: i64,

    http: RwLock<Option<reqwest::Client>>,
    stream: tokio::sync::Mutex<Option<EventStream>>,
    /// Serializes submit/upload operations against this instance.
    submit_lock: tokio::sync::Mutex<()>,

    connected: AtomicBool,
    active_generations: AtomicU32,
    total_generations: AtomicU64,
    last_used: RwLock<Instant>,
    active_prompts: RwLock<HashSet<String>>,
}

impl EngineInstance {
    pub fn new(config: &InstanceConfig) -> Self {
        let base_url = config.url.trim_end_matches('/').to_string();
        let ws_url = base_url.replacen("http", "ws", 1);
        Self {
            base_url,
            ws_url,
            weight: config.weight.max(1),
            auth: config.auth.as_ref().map(EngineAuth::from),
            client_id: Uuid::new_v4().to_string(),
            timeout_secs: config.timeout_secs,
            http: RwLock::new(None),
            stream: tokio::sync::Mutex::new(None),
            submit_lock: tokio::sync::Mutex::new(()),
            connected: AtomicBool::new(false),
            active_generations: AtomicU32::new(0),
            total_generations: AtomicU64::new(0),
            last_used: RwLock::new(Instant::now()),
            active_prompts: RwLock::new(HashSet::new()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn active_generations(&self) -> u32 {
        self.active_generations.load(Ordering::SeqCst)
    }

    pub fn total_generations(&self) -> u64 {
        self.total_generations.load(Ordering::SeqCst)
    }

    /// Open the HTTP session and the persistent event stream. Fails without
    /// retry on auth rejection; any partial state is released on failure.
    pub async fn initialize(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        match self.try_connect().await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                info!(instance = %self.base_url, "Connected to engine instance");
                Ok(())
            }
            Err(e) => {
                self.cleanup().await;
                Err(e)
            }
        }
    }

    async fn try_connect(&self) -> Result<()> {
        let client = self.http_client()?;

        // Cheap read-only probe that also exercises the credentials.
        let response = client
            .get(format!("{}/history", self.base_url))
            .send()
            .await
            .map_err(|e| GatewayError::ConnectionFailed {
                url: self.base_url.clone(),
                reason: e.to_string(),
            })?;

        match response.status().as_u16() {
            200..=299 => {}
            401 | 403 => {
                return Err(GatewayError::AuthRejected {
                    url: self.base_url.clone(),
                })
            }
            status => {
                return Err(GatewayError::ConnectionFailed {
                    url: self.base_url.clone(),
                    reason: format!("probe returned status {}", status),
                })
            }
        }

        let mut request = format!("{}/ws?clientId={}", self.ws_url, self.client_id)
            .into_client_request()?;
        if let Some(value) = self.auth.as_ref().and_then(|a| a.authorization()) {
            let header = value
                .parse()
                .map_err(|_| GatewayError::Internal("invalid authorization header".to_string()))?;
            request.headers_mut().insert("Authorization", header);
        }

        let connector = self.ws_connector()?;
        let (stream, _) = connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|e| GatewayError::ConnectionFailed {
                url: self.base_url.clone(),
                reason: format!("event stream handshake failed: {}", e),
            })?;

        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    /// TLS connector for the event stream, mirroring the HTTP session's
    /// verification policy. A disabled verify flag yields a permissive
    /// context rather than a failed handshake.
    fn ws_connector(&self) -> Result<Option<Connector>> {
        if !self.ws_url.starts_with("wss://") {
            return Ok(None);
        }

        let mut builder = native_tls::TlsConnector::builder();
        if let Some(auth) = &self.auth {
            if !auth.ssl_verify {
                builder.danger_accept_invalid_certs(true);
                builder.danger_accept_invalid_hostnames(true);
            }
            if let Some(path) = &auth.ssl_cert {
                let pem = std::fs::read(path)?;
                builder.add_root_certificate(native_tls::Certificate::from_pem(&pem)?);
            }
        }
        Ok(Some(Connector::NativeTls(builder.build()?)))
    }

    /// Get or build the HTTP session with the instance's auth headers and TLS
    /// verification policy.
    pub(crate) fn http_client(&self) -> Result<reqwest::Client> {
        if let Some(client) = self.http.read().as_ref() {
            return Ok(client.clone());
        }

        let mut headers = HeaderMap::new();
        if let Some(value) = self.auth.as_ref().and_then(|a| a.authorization()) {
            let header = HeaderValue::from_str(&value)
                .map_err(|_| GatewayError::Internal("invalid authorization header".to_string()))?;
            headers.insert(AUTHORIZATION, header);
        }

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(auth) = &self.auth {
            if !auth.ssl_verify {
                builder = builder.danger_accept_invalid_certs(true);
            }
            if let Some(path) = &auth.ssl_cert {
                let pem = std::fs::read(path)?;
                builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
            }
        }

        let client = builder.build()?;
        *self.http.write() = Some(client.clone());
        Ok(client)
    }

    /// Tear down both connections and mark disconnected. Idempotent and
    /// never errors; close failures are only logged.
    pub async fn cleanup(&self) {
        let _guard = self.submit_lock.lock().await;
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut stream) = self.stream.lock().await.take() {
            if let Err(e) = stream.close(None).await {
                debug!(instance = %self.base_url, error = %e, "Event stream close failed");
            }
        }
        *self.http.write() = None;
    }

    pub fn mark_used(&self) {
        *self.last_used.write() = Instant::now();
    }

    pub fn is_timed_out(&self) -> bool {
        if self.timeout_secs <= 0 {
            return false;
        }
        self.last_used.read().elapsed() > Duration::from_secs(self.timeout_secs as u64)
    }

    /// Increment `active_generations`, returning a guard whose drop balances
    /// the increment on every exit path.
    pub(crate) fn begin_generation(&self) -> GenerationTicket<'_> {
        self.active_generations.fetch_add(1, Ordering::SeqCst);
        GenerationTicket { instance: self }
    }

    pub(crate) fn record_completed_submission(&self) {
        self.total_generations.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) async fn submit_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.submit_lock.lock().await
    }

    pub(crate) fn stream_slot(&self) -> &tokio::sync::Mutex<Option<EventStream>> {
        &self.stream
    }

    pub(crate) fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            warn!(instance = %self.base_url, "Instance marked disconnected");
        }
    }

    pub fn track_prompt(&self, prompt_id: &str) {
        self.active_prompts.write().insert(prompt_id.to_string());
    }

    pub fn untrack_prompt(&self, prompt_id: &str) {
        self.active_prompts.write().remove(prompt_id);
    }

    pub fn has_active_prompts(&self) -> bool {
        !self.active_prompts.read().is_empty()
    }

    pub fn tracks_prompt(&self, prompt_id: &str) -> bool {
        self.active_prompts.read().contains(prompt_id)
    }

    /// Retrieval URL for a named output artifact on this instance.
    pub(crate) fn view_url(&self, filename: &str, subfolder: &str, kind: &str) -> Result<reqwest::Url> {
        let mut params: Vec<(&str, &str)> = vec![("filename", filename)];
        if !subfolder.is_empty() {
            params.push(("subfolder", subfolder));
        }
        params.push(("type", kind));
        reqwest::Url::parse_with_params(&format!("{}/view", self.base_url), &params)
            .map_err(|e| GatewayError::Internal(format!("invalid view url: {}", e)))
    }

    #[cfg(test)]
    pub(crate) fn force_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) async fn attach_stream(&self, stream: EventStream) {
        *self.stream.lock().await = Some(stream);
        self.connected.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn set_active_generations(&self, value: u32) {
        self.active_generations.store(value, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_used(&self, secs: u64) {
        *self.last_used.write() = Instant::now() - Duration::from_secs(secs);
    }
}

/// Scoped accounting for one in-flight submission.
pub(crate) struct GenerationTicket<'a> {
    instance: &'a EngineInstance,
}

impl Drop for GenerationTicket<'_> {
    fn drop(&mut self) {
        self.instance.active_generations.fetch_sub(1, Ordering::SeqCst);
    }
}
