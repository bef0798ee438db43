//! Multi-instance generation client: submission with retry, asset upload,
//! and event-stream monitoring of in-flight jobs.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::{RetryConfig, Settings};
use crate::engine::instance::{EngineInstance, EventStream};
use crate::engine::load_balancer::LoadBalancer;
use crate::engine::stream::{
    build_progress_bar, decode_preview, media_refs, ExecutedData, ExecutingData, ProgressData,
    ProgressTracker, StreamEvent, MEDIA_KEYS,
};
use crate::engine::{JobUpdate, MediaFile, ProgressSink};
use crate::error::{GatewayError, Result};
use crate::hooks::{HookEvent, HookManager};

/// HTTP statuses retried with backoff.
const TRANSIENT_STATUSES: [u16; 3] = [502, 503, 504];

/// Upper bound on a single retry backoff, whatever the configured policy.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff for the given attempt, saturating instead of
/// overflowing on extreme retry configurations.
fn retry_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    Duration::from_millis(retry.base_delay_ms.saturating_mul(factor)).min(MAX_RETRY_DELAY)
}

/// Response to a queued generation request.
#[derive(Debug, Clone, Deserialize)]
pub struct QueuedPrompt {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub number: Option<i64>,
    #[serde(default)]
    pub node_errors: Option<Value>,
}

/// Response to an asset upload.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedAsset {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub subfolder: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

/// Orchestrates the instance pool: submission, uploads, and per-job
/// event-stream monitoring.
pub struct GenerationClient {
    instances: Vec<Arc<EngineInstance>>,
    balancer: LoadBalancer,
    hooks: Arc<HookManager>,
    /// Authoritative routing table: which instance's event stream carries
    /// updates for a given prompt id.
    routes: DashMap<String, Arc<EngineInstance>>,
    show_node_updates: bool,
    retry: RetryConfig,
    sweep_interval: Duration,
}

impl GenerationClient {
    pub fn new(settings: &Settings, hooks: Arc<HookManager>) -> Self {
        let instances: Vec<Arc<EngineInstance>> = settings
            .instances
            .iter()
            .map(|config| Arc::new(EngineInstance::new(config)))
            .collect();

        let balancer = LoadBalancer::new(
            instances.clone(),
            settings.load_balancer.strategy,
            hooks.clone(),
        );

        Self {
            instances,
            balancer,
            hooks,
            routes: DashMap::new(),
            show_node_updates: settings.show_node_updates,
            retry: settings.retry.clone(),
            sweep_interval: Duration::from_secs(settings.sweep_interval_secs),
        }
    }

    pub fn instances(&self) -> &[Arc<EngineInstance>] {
        &self.instances
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Initialize the pool and start the idle sweep. Individual instance
    /// failures are logged; connecting fails only when nothing came up.
    pub async fn connect(&self) -> Result<()> {
        let mut connected = 0usize;
        for instance in &self.instances {
            self.hooks
                .execute_hook(HookEvent::InstanceCreating {
                    address: instance.base_url().to_string(),
                })
                .await?;

            match instance.initialize().await {
                Ok(()) => {
                    connected += 1;
                    self.hooks
                        .execute_hook(HookEvent::InstanceCreated {
                            address: instance.base_url().to_string(),
                        })
                        .await?;
                }
                Err(e) => {
                    warn!(instance = %instance.base_url(), error = %e, "Instance failed to initialize");
                }
            }
        }

        if connected == 0 {
            return Err(GatewayError::NoAvailableInstances);
        }

        self.balancer.start_sweep(self.sweep_interval).await;
        info!(
            connected,
            total = self.instances.len(),
            "Generation client connected"
        );
        Ok(())
    }

    /// Stop the sweep and tear down every instance.
    pub async fn close(&self) {
        self.balancer.stop_sweep().await;
        for instance in &self.instances {
            instance.cleanup().await;
        }
    }

    /// Submit a workflow payload. When `instance` is given (an uploaded
    /// asset pins the job to its instance), the balancer is bypassed.
    pub async fn generate(
        &self,
        workflow: Value,
        instance: Option<Arc<EngineInstance>>,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Result<QueuedPrompt> {
        let instance = match instance {
            Some(pinned) => {
                pinned.mark_used();
                pinned
            }
            None => self.balancer.get_instance(sink).await?,
        };

        let _submit = instance.submit_guard().await;
        let _ticket = instance.begin_generation();

        let queued = self.submit_with_retry(&instance, &workflow).await?;

        if let Some(prompt_id) = &queued.prompt_id {
            self.routes.insert(prompt_id.clone(), instance.clone());
            instance.track_prompt(prompt_id);
        }
        instance.record_completed_submission();

        Ok(queued)
    }

    async fn submit_with_retry(
        &self,
        instance: &EngineInstance,
        workflow: &Value,
    ) -> Result<QueuedPrompt> {
        let client = instance.http_client()?;
        let url = format!("{}/prompt", instance.base_url());
        // The engine scopes event-stream messages by the submitting client id.
        let body = json!({
            "prompt": workflow,
            "client_id": instance.client_id(),
        });

        let mut attempt = 0u32;
        loop {
            let response = client.post(&url).json(&body).send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response.json::<QueuedPrompt>().await?);
            }

            let text = response.text().await.unwrap_or_default();
            // An empty-body 404 is a transient routing glitch; a 404 with a
            // body is an application-level error and is not retried.
            let transient = TRANSIENT_STATUSES.contains(&status.as_u16())
                || (status.as_u16() == 404 && text.trim().is_empty());

            if transient && attempt < self.retry.max_retries {
                let delay = retry_delay(&self.retry, attempt);
                warn!(
                    instance = %instance.base_url(),
                    status = status.as_u16(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Transient generation failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            return Err(GatewayError::RequestFailed {
                status: status.as_u16(),
                body: text,
            });
        }
    }

    /// Upload an input asset. Returns the instance it landed on so the
    /// caller can pin the follow-up [`generate`] to it — the asset only
    /// exists on that instance's filesystem.
    ///
    /// [`generate`]: GenerationClient::generate
    pub async fn upload_image(
        &self,
        data: Vec<u8>,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Result<(UploadedAsset, Arc<EngineInstance>)> {
        let instance = self.balancer.get_instance(sink).await?;
        let _submit = instance.submit_guard().await;

        let result = self.do_upload(&instance, data).await;
        // Uploading counts as activity whether or not it succeeded.
        instance.mark_used();
        result.map(|asset| (asset, instance.clone()))
    }

    async fn do_upload(&self, instance: &EngineInstance, data: Vec<u8>) -> Result<UploadedAsset> {
        let client = instance.http_client()?;
        let form = reqwest::multipart::Form::new()
            .part("image", reqwest::multipart::Part::bytes(data).file_name("input.png"));

        let response = client
            .post(format!("{}/upload/image", instance.base_url()))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::UploadFailed {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<UploadedAsset>().await?)
    }

    /// Await the event stream of the instance that owns `prompt_id` until the
    /// job reaches a terminal state, pushing normalized updates to `sink`.
    /// The prompt is removed from the routing map and the instance's active
    /// set on every exit path.
    pub async fn listen_for_updates(&self, prompt_id: &str, sink: &dyn ProgressSink) -> Result<()> {
        let instance = self
            .routes
            .get(prompt_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| GatewayError::UnknownPrompt(prompt_id.to_string()))?;

        let result = self.drive_stream(&instance, prompt_id, sink).await;

        instance.untrack_prompt(prompt_id);
        self.routes.remove(prompt_id);
        result
    }

    async fn drive_stream(
        &self,
        instance: &Arc<EngineInstance>,
        prompt_id: &str,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        if !instance.is_connected() {
            return Err(GatewayError::UnknownPrompt(prompt_id.to_string()));
        }

        // One logical reader per instance stream; the slot lock is held for
        // the whole listen.
        let mut slot = instance.stream_slot().lock().await;
        let result = match slot.as_mut() {
            Some(stream) => self.read_loop(stream, instance, prompt_id, sink).await,
            None => Err(GatewayError::UnknownPrompt(prompt_id.to_string())),
        };

        if matches!(result, Err(GatewayError::InstanceInterrupted { .. })) {
            *slot = None;
            instance.mark_disconnected();
        }
        result
    }

    async fn read_loop(
        &self,
        stream: &mut EventStream,
        instance: &Arc<EngineInstance>,
        prompt_id: &str,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        let mut tracker = ProgressTracker::new();
        let mut latest_preview: Option<Vec<u8>> = None;
        let mut last_media: Option<MediaFile> = None;
        let mut announced = false;

        loop {
            let message = match stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!(instance = %instance.base_url(), error = %e, "Event stream failed mid-job");
                    sink.send(JobUpdate::status("Connection to the engine was lost."))
                        .await;
                    return Err(GatewayError::InstanceInterrupted {
                        url: instance.base_url().to_string(),
                    });
                }
                None => {
                    sink.send(JobUpdate::status("Connection to the engine was lost."))
                        .await;
                    return Err(GatewayError::InstanceInterrupted {
                        url: instance.base_url().to_string(),
                    });
                }
            };

            match message {
                Message::Binary(payload) => {
                    if let Some(jpeg) = decode_preview(&payload) {
                        latest_preview = Some(jpeg);
                    }
                }
                Message::Text(text) => {
                    let Some(event) = StreamEvent::decode(&text) else {
                        debug!(instance = %instance.base_url(), "Skipping unparseable stream message");
                        continue;
                    };
                    match event {
                        StreamEvent::Progress(data) => {
                            self.on_progress(
                                prompt_id,
                                &data,
                                &mut tracker,
                                &mut latest_preview,
                                sink,
                            )
                            .await;
                        }
                        StreamEvent::Executing(data) => {
                            if data.prompt_id.as_deref() != Some(prompt_id) {
                                continue;
                            }
                            match data {
                                ExecutingData {
                                    node: Some(node), ..
                                } => {
                                    tracker.reset_node(&node);
                                    if self.show_node_updates {
                                        sink.send(JobUpdate::status(format!(
                                            "Processing node {}...",
                                            node
                                        )))
                                        .await;
                                    } else if !announced {
                                        announced = true;
                                        sink.send(JobUpdate::status("Generation in progress..."))
                                            .await;
                                    }
                                }
                                ExecutingData { node: None, .. } => {
                                    // Terminal signal.
                                    sink.send(JobUpdate {
                                        status: "Generation complete!".to_string(),
                                        media: last_media.take(),
                                    })
                                    .await;
                                    return Ok(());
                                }
                            }
                        }
                        StreamEvent::Executed(data) => {
                            if data.prompt_id.as_deref() != Some(prompt_id) {
                                continue;
                            }
                            self.on_executed(instance, &data, &mut last_media, sink)
                                .await;
                        }
                        StreamEvent::Error(data) => {
                            // Errors scoped to another prompt are ignored; an
                            // unattributed error frame has no owner and ends
                            // the job being awaited rather than vanishing.
                            if data.prompt_id.is_some()
                                && data.prompt_id.as_deref() != Some(prompt_id)
                            {
                                continue;
                            }
                            let raw = data
                                .error
                                .map(|v| v.to_string())
                                .unwrap_or_else(|| "unknown engine error".to_string());
                            // Raw engine errors stay in the logs; callers get
                            // a sanitized message.
                            error!(instance = %instance.base_url(), prompt_id, error = %raw, "Engine reported an error");
                            sink.send(JobUpdate::status(
                                "Generation failed. The engine reported an error.",
                            ))
                            .await;
                            return Err(GatewayError::EngineFailure(raw));
                        }
                        StreamEvent::Ignored => {}
                    }
                }
                Message::Close(_) => {
                    sink.send(JobUpdate::status("Connection to the engine was lost."))
                        .await;
                    return Err(GatewayError::InstanceInterrupted {
                        url: instance.base_url().to_string(),
                    });
                }
                _ => {}
            }
        }
    }

    async fn on_progress(
        &self,
        prompt_id: &str,
        data: &ProgressData,
        tracker: &mut ProgressTracker,
        latest_preview: &mut Option<Vec<u8>>,
        sink: &dyn ProgressSink,
    ) {
        if data.prompt_id.as_deref() != Some(prompt_id) {
            return;
        }
        let Some(node) = data.node.as_deref() else {
            return;
        };

        for milestone in tracker.record(node, data.value, data.max) {
            if !self.show_node_updates {
                continue;
            }
            let media = latest_preview.take().map(|jpeg| MediaFile {
                filename: format!("preview_{}.jpg", prompt_id),
                data: jpeg,
            });
            let bar = build_progress_bar(data.value, data.max, 10);
            sink.send(JobUpdate {
                status: format!("Processing node {}...\n{} ({}%)", node, bar, milestone),
                media,
            })
            .await;
        }
    }

    async fn on_executed(
        &self,
        instance: &Arc<EngineInstance>,
        data: &ExecutedData,
        last_media: &mut Option<MediaFile>,
        sink: &dyn ProgressSink,
    ) {
        let Some(output) = &data.output else {
            return;
        };

        for (key, status) in MEDIA_KEYS {
            for media_ref in media_refs(output, key) {
                let downloaded = self
                    .download_media(instance, &media_ref.filename, &media_ref.subfolder, &media_ref.kind)
                    .await;
                match downloaded {
                    Ok(file) => {
                        if key == "images" {
                            *last_media = Some(file.clone());
                        }
                        sink.send(JobUpdate::with_media(status, file)).await;
                    }
                    Err(e) => {
                        warn!(
                            instance = %instance.base_url(),
                            filename = %media_ref.filename,
                            error = %e,
                            "Failed to download generated media"
                        );
                    }
                }
            }
        }
    }

    async fn download_media(
        &self,
        instance: &Arc<EngineInstance>,
        filename: &str,
        subfolder: &str,
        kind: &str,
    ) -> Result<MediaFile> {
        let url = instance.view_url(filename, subfolder, kind)?;
        let client = instance.http_client()?;
        let response = client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::RequestFailed {
                status: status.as_u16(),
                body: String::new(),
            });
        }
        let data = response.bytes().await?.to_vec();
        debug!(instance = %instance.base_url(), filename, size = data.len(), "Downloaded generated media");
        Ok(MediaFile {
            filename: filename.to_string(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstanceConfig, LoadBalancerConfig};
    use crate::engine::load_balancer::LoadBalanceStrategy;
    use crate::hooks::{HookKind, HookVerdict};
    use futures::SinkExt;
    use parking_lot::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct RecordingSink {
        updates: Mutex<Vec<JobUpdate>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                updates: Mutex::new(Vec::new()),
            })
        }

        fn statuses(&self) -> Vec<String> {
            self.updates.lock().iter().map(|u| u.status.clone()).collect()
        }
    }

    #[async_trait::async_trait]
    impl ProgressSink for RecordingSink {
        async fn send(&self, update: JobUpdate) {
            self.updates.lock().push(update);
        }
    }

    fn test_settings(urls: &[&str], show_node_updates: bool) -> Settings {
        Settings {
            instances: urls
                .iter()
                .map(|url| InstanceConfig {
                    url: url.to_string(),
                    weight: 1,
                    timeout_secs: 900,
                    auth: None,
                })
                .collect(),
            load_balancer: LoadBalancerConfig {
                strategy: LoadBalanceStrategy::RoundRobin,
            },
            show_node_updates,
            sweep_interval_secs: 5,
            retry: RetryConfig {
                max_retries: 3,
                base_delay_ms: 1,
            },
            logging: Default::default(),
        }
    }

    fn connected_client(urls: &[&str], show_node_updates: bool) -> GenerationClient {
        let client = GenerationClient::new(
            &test_settings(urls, show_node_updates),
            Arc::new(HookManager::new()),
        );
        for instance in client.instances() {
            instance.force_connected();
        }
        client
    }

    fn prompt_ok(id: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "prompt_id": id,
            "number": 1,
        }))
    }

    #[tokio::test]
    async fn test_generate_registers_routing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(prompt_ok("p-1"))
            .mount(&server)
            .await;

        let client = connected_client(&[&server.uri()], true);
        let queued = client
            .generate(serde_json::json!({"1": {"class_type": "KSampler"}}), None, None)
            .await
            .unwrap();

        assert_eq!(queued.prompt_id.as_deref(), Some("p-1"));
        assert!(client.routes.contains_key("p-1"));
        assert!(client.instances()[0].tracks_prompt("p-1"));
        assert_eq!(client.instances()[0].total_generations(), 1);
        assert_eq!(client.instances()[0].active_generations(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_failures_leave_zero_active() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad workflow"))
            .mount(&server)
            .await;

        let client = connected_client(&[&server.uri()], true);
        let (a, b, c) = tokio::join!(
            client.generate(serde_json::json!({}), None, None),
            client.generate(serde_json::json!({}), None, None),
            client.generate(serde_json::json!({}), None, None),
        );
        assert!(a.is_err() && b.is_err() && c.is_err());
        assert_eq!(client.instances()[0].active_generations(), 0);
    }

    #[tokio::test]
    async fn test_empty_body_404_is_retried() {
        let server = MockServer::start().await;
        // First attempt hits the transient empty-body 404, second succeeds.
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(404))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(prompt_ok("p-2"))
            .expect(1)
            .mount(&server)
            .await;

        let client = connected_client(&[&server.uri()], true);
        let queued = client.generate(serde_json::json!({}), None, None).await.unwrap();
        assert_eq!(queued.prompt_id.as_deref(), Some("p-2"));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_404_with_body_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such route"))
            .expect(1)
            .mount(&server)
            .await;

        let client = connected_client(&[&server.uri()], true);
        let result = client.generate(serde_json::json!({}), None, None).await;
        match result {
            Err(GatewayError::RequestFailed { status, body }) => {
                assert_eq!(status, 404);
                assert_eq!(body, "no such route");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        server.verify().await;
    }

    #[tokio::test]
    async fn test_transient_statuses_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(prompt_ok("p-3"))
            .expect(1)
            .mount(&server)
            .await;

        let client = connected_client(&[&server.uri()], true);
        let queued = client.generate(serde_json::json!({}), None, None).await.unwrap();
        assert_eq!(queued.prompt_id.as_deref(), Some("p-3"));
        server.verify().await;
    }

    #[tokio::test]
    async fn test_400_fails_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid"))
            .expect(1)
            .mount(&server)
            .await;

        let client = connected_client(&[&server.uri()], true);
        assert!(client.generate(serde_json::json!({}), None, None).await.is_err());
        server.verify().await;
    }

    #[test]
    fn test_retry_delay_grows_and_is_capped() {
        let retry = RetryConfig {
            max_retries: 3,
            base_delay_ms: 500,
        };
        assert_eq!(retry_delay(&retry, 0), Duration::from_millis(500));
        assert_eq!(retry_delay(&retry, 2), Duration::from_millis(2000));

        // Extreme configurations saturate instead of overflowing.
        let extreme = RetryConfig {
            max_retries: u32::MAX,
            base_delay_ms: u64::MAX,
        };
        assert_eq!(retry_delay(&extreme, 63), MAX_RETRY_DELAY);
        assert_eq!(retry_delay(&extreme, u32::MAX), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_makes_four_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/prompt"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .expect(4)
            .mount(&server)
            .await;

        let client = connected_client(&[&server.uri()], true);
        let result = client.generate(serde_json::json!({}), None, None).await;
        match result {
            Err(GatewayError::RequestFailed { status, body }) => {
                assert_eq!(status, 502);
                assert_eq!(body, "bad gateway");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        server.verify().await;
    }

    #[tokio::test]
    async fn test_upload_returns_owning_instance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/image"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "input.png",
                "subfolder": "",
                "type": "input",
            })))
            .mount(&server)
            .await;

        let client = connected_client(&[&server.uri()], true);
        let (asset, instance) = client.upload_image(vec![1, 2, 3], None).await.unwrap();
        assert_eq!(asset.name.as_deref(), Some("input.png"));
        assert!(Arc::ptr_eq(&instance, &client.instances()[0]));
    }

    #[tokio::test]
    async fn test_upload_failure_surfaces_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/image"))
            .respond_with(ResponseTemplate::new(413).set_body_string("too large"))
            .mount(&server)
            .await;

        let client = connected_client(&[&server.uri()], true);
        let result = client.upload_image(vec![0; 16], None).await;
        match result {
            Err(GatewayError::UploadFailed { status, body }) => {
                assert_eq!(status, 413);
                assert_eq!(body, "too large");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_connect_runs_creation_hooks() {
        let hooks = Arc::new(HookManager::new());
        let creating: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let created: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let creating_clone = creating.clone();
        hooks.register_hook(
            HookKind::InstanceCreating,
            Arc::new(move |event| {
                let creating = creating_clone.clone();
                Box::pin(async move {
                    creating.lock().push(event.address().to_string());
                    Ok(HookVerdict::Allow)
                })
            }),
        );
        let created_clone = created.clone();
        hooks.register_hook(
            HookKind::InstanceCreated,
            Arc::new(move |event| {
                let created = created_clone.clone();
                Box::pin(async move {
                    created.lock().push(event.address().to_string());
                    Ok(HookVerdict::Allow)
                })
            }),
        );

        // Port 1 refuses the probe, so initialization fails after the
        // pre-creation hook and the post-creation hook never fires.
        let client = GenerationClient::new(&test_settings(&["http://127.0.0.1:1"], true), hooks);
        let result = client.connect().await;

        assert!(matches!(result, Err(GatewayError::NoAvailableInstances)));
        assert_eq!(*creating.lock(), vec!["http://127.0.0.1:1".to_string()]);
        assert!(created.lock().is_empty());
    }

    #[tokio::test]
    async fn test_listen_unknown_prompt_fails() {
        let client = connected_client(&["http://localhost:8188"], true);
        let sink = RecordingSink::new();
        let result = client.listen_for_updates("ghost", sink.as_ref()).await;
        assert!(matches!(result, Err(GatewayError::UnknownPrompt(_))));
    }

    // --- event-stream tests against an in-process server ---

    fn text_frame(value: serde_json::Value) -> Message {
        Message::Text(value.to_string())
    }

    async fn spawn_stream_server(frames: Vec<Message>, hold_open: bool) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            for frame in frames {
                if ws.send(frame).await.is_err() {
                    return;
                }
            }
            if hold_open {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
        addr
    }

    /// Wire a client whose single instance routes `prompt_id` through a
    /// stream fed by `frames`. HTTP (media downloads) goes to `http_base`.
    async fn listening_client(
        http_base: &str,
        prompt_id: &str,
        frames: Vec<Message>,
        hold_open: bool,
        show_node_updates: bool,
    ) -> GenerationClient {
        let client = connected_client(&[http_base], show_node_updates);
        let addr = spawn_stream_server(frames, hold_open).await;
        let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        let instance = client.instances()[0].clone();
        instance.attach_stream(stream).await;
        instance.track_prompt(prompt_id);
        client.routes.insert(prompt_id.to_string(), instance);
        client
    }

    #[tokio::test]
    async fn test_listen_full_generation_flow() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/view"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9u8; 32]))
            .mount(&server)
            .await;

        let frames = vec![
            text_frame(serde_json::json!({
                "type": "executing",
                "data": {"prompt_id": "p-1", "node": "3"},
            })),
            text_frame(serde_json::json!({
                "type": "progress",
                "data": {"prompt_id": "p-1", "node": "3", "value": 10, "max": 20},
            })),
            // Progress for a different prompt sharing the stream is ignored.
            text_frame(serde_json::json!({
                "type": "progress",
                "data": {"prompt_id": "someone-else", "node": "3", "value": 20, "max": 20},
            })),
            Message::Text("{not json".to_string()),
            text_frame(serde_json::json!({
                "type": "executed",
                "data": {"prompt_id": "p-1", "output": {"images": [{"filename": "out.png"}]}},
            })),
            text_frame(serde_json::json!({
                "type": "executing",
                "data": {"prompt_id": "p-1", "node": null},
            })),
        ];

        let client = listening_client(&server.uri(), "p-1", frames, true, true).await;
        let sink = RecordingSink::new();
        client.listen_for_updates("p-1", sink.as_ref()).await.unwrap();

        let statuses = sink.statuses();
        assert!(statuses.iter().any(|s| s.contains("Processing node 3")));
        assert!(statuses.iter().any(|s| s.contains("(50%)")));
        assert!(!statuses.iter().any(|s| s.contains("(100%)")));
        assert!(statuses.iter().any(|s| s == "New image generated!"));
        assert_eq!(statuses.last().unwrap(), "Generation complete!");

        // The completion update re-delivers the last primary media.
        let updates = sink.updates.lock();
        let complete = updates.last().unwrap();
        assert_eq!(complete.media.as_ref().unwrap().filename, "out.png");
        assert_eq!(complete.media.as_ref().unwrap().data, vec![9u8; 32]);
        drop(updates);

        // Routing is cleaned up on the success path.
        assert!(!client.routes.contains_key("p-1"));
        assert!(!client.instances()[0].tracks_prompt("p-1"));
    }

    #[tokio::test]
    async fn test_listen_error_event_sanitizes_and_cleans_up() {
        let frames = vec![text_frame(serde_json::json!({
            "type": "error",
            "data": {"prompt_id": "p-err", "error": "CUDA out of memory at layer 7"},
        }))];

        let client = listening_client("http://localhost:9", "p-err", frames, true, true).await;
        let sink = RecordingSink::new();
        let result = client.listen_for_updates("p-err", sink.as_ref()).await;

        match result {
            Err(GatewayError::EngineFailure(raw)) => assert!(raw.contains("CUDA")),
            other => panic!("unexpected result: {:?}", other),
        }
        // End users never see the raw engine error text.
        assert!(sink.statuses().iter().all(|s| !s.contains("CUDA")));
        assert!(sink.statuses().iter().any(|s| s.contains("Generation failed")));
        assert!(!client.routes.contains_key("p-err"));
        assert!(!client.instances()[0].tracks_prompt("p-err"));
    }

    #[tokio::test]
    async fn test_listen_unattributed_error_ends_job() {
        let frames = vec![text_frame(serde_json::json!({
            "type": "error",
            "data": {"error": "scheduler died"},
        }))];

        let client = listening_client("http://localhost:9", "p-any", frames, true, true).await;
        let sink = RecordingSink::new();
        let result = client.listen_for_updates("p-any", sink.as_ref()).await;

        assert!(matches!(result, Err(GatewayError::EngineFailure(_))));
        assert!(sink.statuses().iter().any(|s| s.contains("Generation failed")));
        assert!(!client.routes.contains_key("p-any"));
    }

    #[tokio::test]
    async fn test_listen_stream_closure_is_interruption() {
        let frames = vec![text_frame(serde_json::json!({
            "type": "executing",
            "data": {"prompt_id": "p-gone", "node": "1"},
        }))];

        // Server drops the connection after one frame.
        let client = listening_client("http://localhost:9", "p-gone", frames, false, true).await;
        let sink = RecordingSink::new();
        let result = client.listen_for_updates("p-gone", sink.as_ref()).await;

        assert!(result.as_ref().err().map(|e| e.is_interruption()).unwrap_or(false));
        assert!(!client.routes.contains_key("p-gone"));
        assert!(!client.instances()[0].is_connected());
    }

    #[tokio::test]
    async fn test_node_update_suppression() {
        let mut frames: Vec<Message> = (1..=5)
            .map(|n| {
                text_frame(serde_json::json!({
                    "type": "executing",
                    "data": {"prompt_id": "p-quiet", "node": n.to_string()},
                }))
            })
            .collect();
        frames.push(text_frame(serde_json::json!({
            "type": "progress",
            "data": {"prompt_id": "p-quiet", "node": "5", "value": 100, "max": 100},
        })));
        frames.push(text_frame(serde_json::json!({
            "type": "executing",
            "data": {"prompt_id": "p-quiet", "node": null},
        })));

        let client = listening_client("http://localhost:9", "p-quiet", frames, true, false).await;
        let sink = RecordingSink::new();
        client.listen_for_updates("p-quiet", sink.as_ref()).await.unwrap();

        let statuses = sink.statuses();
        assert_eq!(
            statuses,
            vec![
                "Generation in progress...".to_string(),
                "Generation complete!".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_node_updates_enabled_are_chatty() {
        let frames = vec![
            text_frame(serde_json::json!({
                "type": "executing",
                "data": {"prompt_id": "p-loud", "node": "1"},
            })),
            text_frame(serde_json::json!({
                "type": "executing",
                "data": {"prompt_id": "p-loud", "node": "2"},
            })),
            text_frame(serde_json::json!({
                "type": "executing",
                "data": {"prompt_id": "p-loud", "node": null},
            })),
        ];

        let client = listening_client("http://localhost:9", "p-loud", frames, true, true).await;
        let sink = RecordingSink::new();
        client.listen_for_updates("p-loud", sink.as_ref()).await.unwrap();
        assert!(sink.statuses().len() > 2);
    }

    #[tokio::test]
    async fn test_preview_frame_attaches_to_next_milestone() {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            2,
            2,
            image::Rgb([0, 128, 255]),
        ));
        let mut png = std::io::Cursor::new(Vec::new());
        img.write_to(&mut png, image::ImageFormat::Png).unwrap();
        let mut preview = Vec::new();
        preview.extend_from_slice(&1u32.to_be_bytes());
        preview.extend_from_slice(&2u32.to_be_bytes());
        preview.extend_from_slice(&png.into_inner());

        let frames = vec![
            Message::Binary(preview),
            // Malformed preview payloads are swallowed.
            Message::Binary(vec![0u8; 4]),
            text_frame(serde_json::json!({
                "type": "progress",
                "data": {"prompt_id": "p-prev", "node": "1", "value": 50, "max": 100},
            })),
            text_frame(serde_json::json!({
                "type": "progress",
                "data": {"prompt_id": "p-prev", "node": "1", "value": 75, "max": 100},
            })),
            text_frame(serde_json::json!({
                "type": "executing",
                "data": {"prompt_id": "p-prev", "node": null},
            })),
        ];

        let client = listening_client("http://localhost:9", "p-prev", frames, true, true).await;
        let sink = RecordingSink::new();
        client.listen_for_updates("p-prev", sink.as_ref()).await.unwrap();

        let updates = sink.updates.lock();
        let with_preview: Vec<_> = updates
            .iter()
            .filter(|u| u.media.as_ref().map(|m| m.filename.starts_with("preview_")).unwrap_or(false))
            .collect();
        // Cached preview is consumed by exactly one progress update.
        assert_eq!(with_preview.len(), 1);
        assert_eq!(&with_preview[0].media.as_ref().unwrap().data[0..2], &[0xFF, 0xD8]);
    }
}
