use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};

use crate::proxy::channel_registry::ChannelRegistry;
use crate::proxy::config::{RelayConfig, StreamingMode};
use crate::proxy::error::{QueueError, RelayError, RotationError, TIMEOUT_STATUS};
use crate::proxy::mappers::sse;
use crate::proxy::message_queue::MessageQueue;
use crate::proxy::protocol::{
    is_forwardable_response_header, CancelRequest, ProxyRequest, RelayMessage,
};
use crate::proxy::rotation::{RotationController, SwitchOutcome};

/// Timing and retry knobs of the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Total attempts per pseudo-stream/buffered request
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub idle_timeout: Duration,
    pub stream_stall: Duration,
    pub keepalive: Duration,
    pub recovery_wait: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            idle_timeout: Duration::from_secs(config.timeouts.idle_secs),
            stream_stall: Duration::from_secs(config.timeouts.stream_stall_secs),
            keepalive: Duration::from_secs(config.timeouts.keepalive_secs.max(1)),
            recovery_wait: Duration::from_secs(config.timeouts.recovery_wait_secs),
        }
    }
}

/// Complete peer answer of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PeerResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: String,
}

/// Per-request cleanup. Always unregisters the queue; tells the peer to stop when
/// the request ends before completing; runs a rotation deferred by the usage quota.
struct RequestGuard {
    registry: Arc<ChannelRegistry>,
    rotation: Arc<RotationController>,
    request_id: String,
    completed: bool,
    rotate_after: bool,
}

impl RequestGuard {
    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if !self.completed {
            tracing::info!(request_id = %self.request_id, "Client went away, cancelling request");
            match serde_json::to_string(&CancelRequest::new(&self.request_id)) {
                Ok(frame) => {
                    if let Err(e) = self.registry.send(frame) {
                        tracing::debug!(request_id = %self.request_id, "Cancel not delivered: {}", e);
                    }
                }
                Err(e) => tracing::warn!("Failed to serialize cancel frame: {}", e),
            }
        }

        self.registry.remove_queue(&self.request_id);

        if self.rotate_after {
            let rotation = self.rotation.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    log_switch(&rotation.rotate_for_usage().await);
                });
            }
        }
    }
}

/// Wire id of a retry; the first attempt keeps the request's own id.
fn attempt_id(request_id: &str, attempt: u32) -> String {
    format!("{}-attempt-{}", request_id, attempt)
}

fn log_switch(result: &Result<SwitchOutcome, RotationError>) -> Option<String> {
    match result {
        Ok(outcome @ SwitchOutcome::Switched { .. }) => {
            tracing::info!("{}", outcome.describe());
            None
        }
        Ok(outcome @ SwitchOutcome::FellBack { .. }) => {
            let note = outcome.describe();
            tracing::warn!("{}", note);
            Some(note)
        }
        Err(RotationError::OnlyOneAccount) => {
            tracing::info!("Rotation skipped: only one account available");
            None
        }
        Err(RotationError::AlreadySwitching) => {
            tracing::debug!("Rotation skipped: a switch is already running");
            None
        }
        Err(e) => {
            tracing::error!("Account rotation failed: {}", e);
            Some(e.to_string())
        }
    }
}

fn with_note(err: RelayError, note: Option<String>) -> RelayError {
    match (err, note) {
        (RelayError::Upstream { status, message }, Some(note)) => RelayError::Upstream {
            status,
            message: format!("{} ({})", message, note),
        },
        (err, _) => err,
    }
}

fn response_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        if !is_forwardable_response_header(name) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => tracing::debug!("Skipping invalid response header {:?}", name),
        }
    }
    map
}

fn sse_response(body: Body) -> Response {
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

/// Drives each inbound request through admission, dispatch, response assembly,
/// retry and failure escalation.
pub struct RequestOrchestrator {
    registry: Arc<ChannelRegistry>,
    rotation: Arc<RotationController>,
    streaming_mode: RwLock<StreamingMode>,
    settings: OrchestratorSettings,
}

impl RequestOrchestrator {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        rotation: Arc<RotationController>,
        streaming_mode: StreamingMode,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            rotation,
            streaming_mode: RwLock::new(streaming_mode),
            settings,
        }
    }

    pub async fn streaming_mode(&self) -> StreamingMode {
        *self.streaming_mode.read().await
    }

    pub async fn set_streaming_mode(&self, mode: StreamingMode) {
        let mut current = self.streaming_mode.write().await;
        if *current != mode {
            tracing::info!("Streaming mode changed: {} -> {}", current.as_str(), mode.as_str());
        }
        *current = mode;
    }

    /// Relays one request and produces the client response.
    pub async fn handle(self: &Arc<Self>, mut request: ProxyRequest) -> Response {
        if let Err(e) = self.admit().await {
            tracing::warn!(request_id = %request.request_id, "Request rejected: {}", e);
            return e.into_response();
        }

        let wants_stream = request.wants_stream();
        request.streaming_mode = if wants_stream {
            self.streaming_mode().await
        } else {
            StreamingMode::Fake
        };

        let rotate_after = self.rotation.record_usage(request.is_generative);
        let queue = self.registry.create_queue(&request.request_id);
        let guard = RequestGuard {
            registry: self.registry.clone(),
            rotation: self.rotation.clone(),
            request_id: request.request_id.clone(),
            completed: false,
            rotate_after,
        };

        tracing::info!(
            request_id = %request.request_id,
            method = %request.method,
            path = %request.path,
            mode = request.streaming_mode.as_str(),
            stream = wants_stream,
            "Relaying request"
        );

        match (wants_stream, request.streaming_mode) {
            (true, StreamingMode::Real) => self.relay_real(request, queue, guard).await,
            (true, StreamingMode::Fake) => self.relay_pseudo(request, queue, guard),
            (false, _) => self.relay_buffered(request, queue, guard).await,
        }
    }

    /// Refuses work during rotation; tries to bring the peer back when it is missing
    /// or when the service is degraded.
    async fn admit(&self) -> Result<(), RelayError> {
        if self.rotation.is_busy() {
            return Err(RelayError::AdmissionRejected(
                "account switch in progress, retry shortly".to_string(),
            ));
        }
        let degraded = self.rotation.is_degraded();
        if self.registry.has_peer() && !degraded {
            return Ok(());
        }

        if degraded {
            tracing::warn!("Service degraded, attempting to reactivate the current account");
        } else {
            tracing::warn!("No bridging peer connected, attempting browser recovery");
        }
        match self.rotation.recover_current().await {
            Ok(_) => {}
            Err(RotationError::AlreadySwitching) => {
                return Err(RelayError::AdmissionRejected(
                    "browser recovery in progress, retry shortly".to_string(),
                ))
            }
            Err(e) => {
                return Err(RelayError::AdmissionRejected(format!(
                    "browser recovery failed: {}",
                    e
                )))
            }
        }

        if self.registry.wait_for_peer(self.settings.recovery_wait).await {
            Ok(())
        } else {
            Err(RelayError::AdmissionRejected(
                "browser did not reconnect after recovery".to_string(),
            ))
        }
    }

    fn dispatch(&self, request: &ProxyRequest) -> Result<(), RelayError> {
        let frame =
            serde_json::to_string(request).map_err(|e| RelayError::Serialize(e.to_string()))?;
        self.registry.send(frame)
    }

    fn cancel_upstream(&self, request_id: &str) {
        if let Ok(frame) = serde_json::to_string(&CancelRequest::new(request_id)) {
            let _ = self.registry.send(frame);
        }
    }

    /// Counts a terminal failure and rotates without waiting.
    fn escalate_in_background(&self, is_generative: bool, status: Option<u16>) {
        if !is_generative || !self.rotation.record_failure(status) {
            return;
        }
        let rotation = self.rotation.clone();
        tokio::spawn(async move {
            log_switch(&rotation.switch_to_next().await);
        });
    }

    /// Counts a terminal failure and finishes any resulting rotation before returning.
    async fn escalate(&self, is_generative: bool, status: Option<u16>) -> Option<String> {
        if !is_generative || !self.rotation.record_failure(status) {
            return None;
        }
        log_switch(&self.rotation.switch_to_next().await)
    }

    /// Forwards fragments as they arrive.
    async fn relay_real(
        self: &Arc<Self>,
        request: ProxyRequest,
        queue: Arc<MessageQueue>,
        mut guard: RequestGuard,
    ) -> Response {
        let request_id = request.request_id.clone();
        let is_generative = request.is_generative;

        if let Err(e) = self.dispatch(&request) {
            guard.complete();
            self.escalate_in_background(is_generative, e.upstream_status());
            return e.into_response();
        }

        let (status, headers, first_chunk) = match queue.dequeue(self.settings.idle_timeout).await {
            Ok(RelayMessage::ResponseHeaders { status, headers }) => (status, headers, None),
            Ok(RelayMessage::Chunk(data)) => {
                tracing::debug!(request_id = %request_id, "Fragment arrived before headers");
                let mut headers = HashMap::new();
                headers.insert("content-type".to_string(), "text/event-stream".to_string());
                (200, headers, Some(data))
            }
            Ok(message @ RelayMessage::Error { .. }) if message.is_cancellation() => {
                guard.complete();
                tracing::info!(request_id = %request_id, "Request aborted by the browser");
                return RelayError::ClientCancelled.into_response();
            }
            Ok(RelayMessage::Error { status, message }) => {
                guard.complete();
                let err = RelayError::Upstream {
                    status: status.unwrap_or(500),
                    message,
                };
                tracing::warn!(request_id = %request_id, "Upstream error before headers: {}", err);
                self.escalate_in_background(is_generative, err.upstream_status());
                return err.into_response();
            }
            Ok(RelayMessage::StreamEnd) => {
                guard.complete();
                let err = RelayError::Upstream {
                    status: 502,
                    message: "stream closed before response headers".to_string(),
                };
                self.escalate_in_background(is_generative, err.upstream_status());
                return err.into_response();
            }
            Err(e) => {
                guard.complete();
                if e == QueueError::Timeout {
                    self.cancel_upstream(&request_id);
                }
                let err = RelayError::from(e);
                tracing::warn!(request_id = %request_id, "No response headers: {}", err);
                self.escalate_in_background(is_generative, err.upstream_status());
                return err.into_response();
            }
        };

        let upstream_ok = status < 400;
        if !upstream_ok {
            tracing::warn!(request_id = %request_id, status, "Upstream answered with an error status");
            self.escalate_in_background(is_generative, Some(status));
        }

        let this = self.clone();
        let stall = self.settings.stream_stall;
        let stream = async_stream::stream! {
            let mut guard = guard;
            let mut failed = false;

            if let Some(data) = first_chunk {
                yield Ok::<Bytes, String>(Bytes::from(data));
            }

            loop {
                match queue.dequeue(stall).await {
                    Ok(RelayMessage::Chunk(data)) => {
                        yield Ok(Bytes::from(data));
                    }
                    Ok(RelayMessage::StreamEnd) => break,
                    Ok(RelayMessage::ResponseHeaders { .. }) => {
                        tracing::debug!(request_id = %request_id, "Ignoring repeated response headers");
                    }
                    Ok(message @ RelayMessage::Error { .. }) if message.is_cancellation() => {
                        tracing::info!(request_id = %request_id, "Stream aborted by the browser");
                        failed = true;
                        break;
                    }
                    Ok(RelayMessage::Error { status, message }) => {
                        let err = RelayError::Upstream {
                            status: status.unwrap_or(500),
                            message,
                        };
                        tracing::warn!(request_id = %request_id, "Upstream error mid-stream: {}", err);
                        this.escalate_in_background(is_generative, err.upstream_status());
                        failed = true;
                        yield Ok(sse::error_frame(&err));
                        break;
                    }
                    Err(QueueError::Timeout) => {
                        tracing::info!(
                            request_id = %request_id,
                            "No fragment for {}s, treating stream as finished",
                            stall.as_secs()
                        );
                        break;
                    }
                    Err(QueueError::Closed) => {
                        let err = RelayError::ConnectionLost;
                        tracing::error!(request_id = %request_id, "Stream interrupted: {}", err);
                        this.escalate_in_background(is_generative, None);
                        failed = true;
                        yield Ok(sse::error_frame(&err));
                        break;
                    }
                }
            }

            if upstream_ok && !failed {
                this.rotation.record_success(is_generative);
            }
            guard.complete();
            tracing::debug!(request_id = %request_id, "Real stream finished");
        };

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        *response.headers_mut() = response_headers(&headers);
        response
    }

    /// Commits an event stream immediately, keeps it alive while attempts run,
    /// then replays the whole result as one event.
    fn relay_pseudo(
        self: &Arc<Self>,
        request: ProxyRequest,
        queue: Arc<MessageQueue>,
        guard: RequestGuard,
    ) -> Response {
        let this = self.clone();
        let period = self.settings.keepalive;

        let stream = async_stream::stream! {
            let mut guard = guard;
            let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);

            let outcome = {
                let attempts = this.run_attempts(&request, queue, &mut guard);
                tokio::pin!(attempts);
                loop {
                    let finished = tokio::select! {
                        result = &mut attempts => Some(result),
                        _ = keepalive.tick() => None,
                    };
                    match finished {
                        Some(result) => break result,
                        None => {
                            yield Ok::<Bytes, String>(sse::keepalive_frame());
                        }
                    }
                }
            };

            match outcome {
                Ok(response) => {
                    this.rotation.record_success(request.is_generative);
                    yield Ok(sse::data_frame(&response.body));
                    yield Ok(sse::done_frame());
                }
                Err(RelayError::ClientCancelled) => {
                    tracing::info!(request_id = %request.request_id, "Request aborted, not retried");
                    yield Ok(sse::error_frame(&RelayError::ClientCancelled));
                }
                Err(err) => {
                    let note = this.escalate(request.is_generative, err.upstream_status()).await;
                    let err = with_note(err, note);
                    tracing::error!(request_id = %request.request_id, "Request failed: {}", err);
                    yield Ok(sse::error_frame(&err));
                }
            }
            guard.complete();
        };

        sse_response(Body::from_stream(stream))
    }

    /// Non-streaming requests: retried like pseudo-stream mode, answered in one piece.
    async fn relay_buffered(
        self: &Arc<Self>,
        request: ProxyRequest,
        queue: Arc<MessageQueue>,
        mut guard: RequestGuard,
    ) -> Response {
        let outcome = self.run_attempts(&request, queue, &mut guard).await;
        guard.complete();

        match outcome {
            Ok(peer) => {
                self.rotation.record_success(request.is_generative);
                let mut response = Response::new(Body::from(peer.body));
                *response.status_mut() =
                    StatusCode::from_u16(peer.status).unwrap_or(StatusCode::OK);
                *response.headers_mut() = response_headers(&peer.headers);
                response
            }
            Err(RelayError::ClientCancelled) => RelayError::ClientCancelled.into_response(),
            Err(err) => {
                let note = self.escalate(request.is_generative, err.upstream_status()).await;
                let err = with_note(err, note);
                tracing::error!(request_id = %request.request_id, "Request failed: {}", err);
                err.into_response()
            }
        }
    }

    /// Retries whole attempts with a fixed delay. Cancellations and a lost
    /// connection end the loop early.
    ///
    /// Every retry runs under its own wire id with a fresh queue, so fragments
    /// that arrive late for an abandoned attempt are dropped by the registry.
    async fn run_attempts(
        &self,
        request: &ProxyRequest,
        queue: Arc<MessageQueue>,
        guard: &mut RequestGuard,
    ) -> Result<PeerResponse, RelayError> {
        let max_attempts = self.settings.max_attempts;
        let mut attempt = 1;
        let mut current = request.clone();
        let mut queue = queue;

        loop {
            let err = match self.attempt_once(&current, &queue).await {
                Ok(response) => {
                    if attempt > 1 {
                        tracing::info!(
                            request_id = %request.request_id,
                            "Succeeded on attempt {}/{}",
                            attempt,
                            max_attempts
                        );
                    }
                    return Ok(response);
                }
                Err(e @ (RelayError::ClientCancelled | RelayError::ConnectionLost)) => return Err(e),
                Err(e) => e,
            };

            self.registry.remove_queue(&current.request_id);
            if matches!(err, RelayError::Upstream { status, .. } if status == TIMEOUT_STATUS) {
                self.cancel_upstream(&current.request_id);
            }

            if attempt >= max_attempts {
                return Err(err);
            }
            tracing::warn!(
                request_id = %request.request_id,
                "Attempt {}/{} failed: {}, retrying in {}ms",
                attempt,
                max_attempts,
                err,
                self.settings.retry_delay.as_millis()
            );

            tokio::time::sleep(self.settings.retry_delay).await;
            attempt += 1;

            current.request_id = attempt_id(&request.request_id, attempt);
            queue = self.registry.create_queue(&current.request_id);
            guard.request_id = current.request_id.clone();
        }
    }

    /// Dispatches the request and collects fragments until the end marker,
    /// bounded by the idle ceiling.
    async fn attempt_once(
        &self,
        request: &ProxyRequest,
        queue: &MessageQueue,
    ) -> Result<PeerResponse, RelayError> {
        self.dispatch(request)?;

        let deadline = Instant::now() + self.settings.idle_timeout;
        let mut response = PeerResponse {
            status: 200,
            headers: HashMap::new(),
            body: String::new(),
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match queue.dequeue(remaining).await? {
                RelayMessage::ResponseHeaders { status, headers } => {
                    response.status = status;
                    response.headers = headers;
                }
                RelayMessage::Chunk(data) => response.body.push_str(&data),
                message @ RelayMessage::Error { .. } if message.is_cancellation() => {
                    return Err(RelayError::ClientCancelled);
                }
                RelayMessage::Error { status, message } => {
                    return Err(RelayError::Upstream {
                        status: status.unwrap_or(500),
                        message,
                    });
                }
                RelayMessage::StreamEnd => break,
            }
        }

        if response.status >= 400 {
            return Err(RelayError::from_upstream_body(response.status, &response.body));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::channel_registry::ChannelEvent;
    use crate::proxy::protocol::PeerFrame;
    use crate::proxy::rotation::tests::{policy, pool_of, RecordingActivator};
    use serde_json::Value;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        _dir: TempDir,
        registry: Arc<ChannelRegistry>,
        rotation: Arc<RotationController>,
        activator: Arc<RecordingActivator>,
        orchestrator: Arc<RequestOrchestrator>,
        outbound: mpsc::UnboundedReceiver<String>,
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            max_attempts: 3,
            retry_delay: Duration::from_millis(10),
            idle_timeout: Duration::from_millis(300),
            stream_stall: Duration::from_millis(200),
            keepalive: Duration::from_secs(30),
            recovery_wait: Duration::from_millis(50),
        }
    }

    async fn harness(threshold: u32, uses: u32) -> Harness {
        harness_with(threshold, uses, Arc::new(RecordingActivator::default())).await
    }

    async fn harness_with(
        threshold: u32,
        uses: u32,
        activator: Arc<RecordingActivator>,
    ) -> Harness {
        let (dir, pool) = pool_of(&[1, 2]);
        let rotation = Arc::new(RotationController::new(
            pool,
            activator.clone(),
            policy(threshold, uses, &[429]),
        ));
        rotation.initialize(Some(1)).await.unwrap();

        let registry = Arc::new(ChannelRegistry::new(Duration::from_millis(50)));
        let (tx, outbound) = mpsc::unbounded_channel();
        registry.add_peer(tx);

        let orchestrator = Arc::new(RequestOrchestrator::new(
            registry.clone(),
            rotation.clone(),
            StreamingMode::Fake,
            settings(),
        ));
        Harness {
            _dir: dir,
            registry,
            rotation,
            activator,
            orchestrator,
            outbound,
        }
    }

    fn request(id: &str, path: &str) -> ProxyRequest {
        ProxyRequest {
            path: path.to_string(),
            method: "POST".to_string(),
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body: "{}".to_string(),
            request_id: id.to_string(),
            streaming_mode: StreamingMode::Real,
            is_generative: crate::proxy::protocol::is_generative_path(path),
        }
    }

    fn frame(value: Value) -> PeerFrame {
        serde_json::from_value(value).unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// Answers every dispatched request with `reply(attempt)`.
    fn spawn_peer<F>(h: &mut Harness, reply: F) -> tokio::task::JoinHandle<Vec<Value>>
    where
        F: Fn(usize, &str) -> Vec<Value> + Send + 'static,
    {
        let registry = h.registry.clone();
        let (_tx, placeholder) = mpsc::unbounded_channel();
        let mut outbound = std::mem::replace(&mut h.outbound, placeholder);
        tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut attempt = 0;
            while let Some(text) = outbound.recv().await {
                let value: Value = serde_json::from_str(&text).unwrap();
                seen.push(value.clone());
                if value.get("event_type").is_some() {
                    continue;
                }
                attempt += 1;
                let id = value["request_id"].as_str().unwrap().to_string();
                for reply in reply(attempt, &id) {
                    registry.route(frame(reply));
                }
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_buffered_success_returns_peer_response() {
        let mut h = harness(3, 0).await;
        spawn_peer(&mut h, |_, id| {
            vec![
                serde_json::json!({"request_id": id, "event_type": "response_headers", "status": 200,
                    "headers": {"content-type": "application/json", "content-length": "999"}}),
                serde_json::json!({"request_id": id, "event_type": "chunk", "data": "{\"ok\":true}"}),
                serde_json::json!({"request_id": id, "event_type": "stream_close"}),
            ]
        });

        let response = h
            .orchestrator
            .handle(request("b1", "/v1beta/models/gemini-pro:generateContent"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert!(response.headers().get("content-length").map(|v| v != "999").unwrap_or(true));
        assert_eq!(body_text(response).await, "{\"ok\":true}");
        assert_eq!(h.registry.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds_without_counting_failure() {
        let mut h = harness(3, 0).await;
        spawn_peer(&mut h, |attempt, id| {
            if attempt == 1 {
                vec![serde_json::json!({"request_id": id, "event_type": "error", "status": 500, "message": "boom"})]
            } else {
                vec![
                    serde_json::json!({"request_id": id, "event_type": "chunk", "data": "{}"}),
                    serde_json::json!({"request_id": id, "event_type": "stream_close"}),
                ]
            }
        });

        let response = h
            .orchestrator
            .handle(request("b2", "/v1beta/models/gemini-pro:generateContent"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.rotation.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_status_and_rotate_on_429() {
        let mut h = harness(3, 0).await;
        let peer = spawn_peer(&mut h, |_, id| {
            vec![serde_json::json!({"request_id": id, "event_type": "error", "status": 429, "message": "quota"})]
        });

        let response = h
            .orchestrator
            .handle(request("b3", "/v1beta/models/gemini-pro:generateContent"))
            .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["code"], 429);

        // immediate-switch status: rotated synchronously before answering
        assert_eq!(h.rotation.current_index(), Some(2));
        assert_eq!(h.activator.calls(), vec![1, 2]);
        peer.abort();
    }

    #[tokio::test]
    async fn test_cancellation_error_is_not_retried() {
        let mut h = harness(1, 0).await;
        let peer = spawn_peer(&mut h, |_, id| {
            vec![serde_json::json!({"request_id": id, "event_type": "error", "message": "The user aborted a request."})]
        });

        let response = h
            .orchestrator
            .handle(request("b4", "/v1beta/models/gemini-pro:generateContent"))
            .await;
        assert_eq!(response.status().as_u16(), 499);
        assert_eq!(h.rotation.failure_count(), 0);
        assert_eq!(h.rotation.current_index(), Some(1));
        peer.abort();
    }

    #[tokio::test]
    async fn test_pseudo_stream_writes_single_event_then_done() {
        let mut h = harness(3, 0).await;
        spawn_peer(&mut h, |_, id| {
            vec![
                serde_json::json!({"request_id": id, "event_type": "chunk",
                    "data": "{\"candidates\":[{\"finishReason\":\"STOP\"}]}"}),
                serde_json::json!({"request_id": id, "event_type": "stream_close"}),
            ]
        });

        let response = h
            .orchestrator
            .handle(request("s1", "/v1beta/models/gemini-pro:streamGenerateContent"))
            .await;
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        assert_eq!(
            body_text(response).await,
            "data: {\"candidates\":[{\"finishReason\":\"STOP\"}]}\n\ndata: [DONE]\n\n"
        );
        assert_eq!(h.rotation.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_real_stream_forwards_chunks_verbatim() {
        let mut h = harness(3, 0).await;
        h.orchestrator.set_streaming_mode(StreamingMode::Real).await;
        spawn_peer(&mut h, |_, id| {
            vec![
                serde_json::json!({"request_id": id, "event_type": "response_headers", "status": 200,
                    "headers": {"content-type": "text/event-stream"}}),
                serde_json::json!({"request_id": id, "event_type": "chunk", "data": "data: {\"a\":1}\n\n"}),
                serde_json::json!({"request_id": id, "event_type": "chunk", "data": "data: {\"a\":2}\n\n"}),
                serde_json::json!({"request_id": id, "event_type": "stream_close"}),
            ]
        });

        let response = h
            .orchestrator
            .handle(request("s2", "/v1beta/models/gemini-pro:streamGenerateContent"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_text(response).await,
            "data: {\"a\":1}\n\ndata: {\"a\":2}\n\n"
        );
        assert_eq!(h.registry.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_dropped_stream_sends_cancel() {
        let mut h = harness(3, 0).await;
        h.orchestrator.set_streaming_mode(StreamingMode::Real).await;
        let registry = h.registry.clone();
        let (_tx, placeholder) = mpsc::unbounded_channel();
        let mut outbound = std::mem::replace(&mut h.outbound, placeholder);

        let response = {
            let orchestrator = h.orchestrator.clone();
            let handle = tokio::spawn(async move {
                orchestrator
                    .handle(request("s3", "/v1beta/models/gemini-pro:streamGenerateContent"))
                    .await
            });
            let dispatched: Value =
                serde_json::from_str(&outbound.recv().await.unwrap()).unwrap();
            assert_eq!(dispatched["request_id"], "s3");
            assert_eq!(dispatched["streaming_mode"], "real");
            registry.route(frame(serde_json::json!({
                "request_id": "s3", "event_type": "response_headers", "status": 200, "headers": {}
            })));
            handle.await.unwrap()
        };
        drop(response);

        let cancel: Value = serde_json::from_str(&outbound.recv().await.unwrap()).unwrap();
        assert_eq!(cancel["event_type"], "cancel_request");
        assert_eq!(cancel["request_id"], "s3");
        assert_eq!(registry.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_busy_rotation_rejects_admission() {
        let activator = Arc::new(RecordingActivator {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let h = harness_with(3, 0, activator).await;

        let switching = {
            let rotation = h.rotation.clone();
            tokio::spawn(async move { rotation.switch_to_next().await })
        };
        while !h.rotation.is_busy() {
            tokio::task::yield_now().await;
        }

        let response = h
            .orchestrator
            .handle(request("a1", "/v1beta/models/gemini-pro:generateContent"))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(switching.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_missing_peer_without_reconnect_is_rejected() {
        let h = harness(3, 0).await;
        let registry = Arc::new(ChannelRegistry::new(Duration::from_millis(10)));
        let orchestrator = Arc::new(RequestOrchestrator::new(
            registry,
            h.rotation.clone(),
            StreamingMode::Fake,
            settings(),
        ));
        let response = orchestrator
            .handle(request("a2", "/v1beta/models/gemini-pro:generateContent"))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        // recovery reactivated the current identity
        assert_eq!(h.activator.calls(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_usage_quota_rotates_after_request() {
        let mut h = harness(0, 1).await;
        spawn_peer(&mut h, |_, id| {
            vec![
                serde_json::json!({"request_id": id, "event_type": "chunk", "data": "{}"}),
                serde_json::json!({"request_id": id, "event_type": "stream_close"}),
            ]
        });

        let response = h
            .orchestrator
            .handle(request("u1", "/v1beta/models/gemini-pro:generateContent"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        for _ in 0..50 {
            if h.rotation.current_index() == Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.rotation.current_index(), Some(2));
    }

    fn take_outbound(h: &mut Harness) -> mpsc::UnboundedReceiver<String> {
        let (_tx, placeholder) = mpsc::unbounded_channel();
        std::mem::replace(&mut h.outbound, placeholder)
    }

    #[tokio::test]
    async fn test_timeout_retry_ignores_fragments_of_abandoned_attempt() {
        let mut h = harness(3, 0).await;
        let registry = h.registry.clone();
        let mut outbound = take_outbound(&mut h);
        let dispatched = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));

        let peer = {
            let dispatched = dispatched.clone();
            tokio::spawn(async move {
                while let Some(text) = outbound.recv().await {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    let id = value["request_id"].as_str().unwrap().to_string();
                    if value["event_type"] == "cancel_request" {
                        // the browser answers the cancel of the silent first attempt
                        registry.route(frame(serde_json::json!(
                            {"request_id": id, "event_type": "chunk", "data": "stale"})));
                        registry.route(frame(serde_json::json!(
                            {"request_id": id, "event_type": "error", "message": "The user aborted a request."})));
                        continue;
                    }
                    let attempt = {
                        let mut seen = dispatched.lock().unwrap();
                        seen.push(id.clone());
                        seen.len()
                    };
                    if attempt > 1 {
                        registry.route(frame(serde_json::json!(
                            {"request_id": id, "event_type": "chunk", "data": "fresh"})));
                        registry.route(frame(serde_json::json!(
                            {"request_id": id, "event_type": "stream_close"})));
                    }
                }
            })
        };

        let response = h
            .orchestrator
            .handle(request("t1", "/v1beta/models/gemini-pro:generateContent"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "fresh");
        assert_eq!(
            *dispatched.lock().unwrap(),
            vec!["t1".to_string(), "t1-attempt-2".to_string()]
        );
        assert_eq!(h.rotation.failure_count(), 0);
        assert_eq!(h.registry.pending_requests(), 0);
        peer.abort();
    }

    #[tokio::test]
    async fn test_real_stream_stall_ends_normally() {
        let mut h = harness(3, 0).await;
        h.orchestrator.set_streaming_mode(StreamingMode::Real).await;
        h.rotation.record_failure(Some(500));
        let peer = spawn_peer(&mut h, |_, id| {
            vec![
                serde_json::json!({"request_id": id, "event_type": "response_headers", "status": 200,
                    "headers": {"content-type": "text/event-stream"}}),
                serde_json::json!({"request_id": id, "event_type": "chunk", "data": "data: {\"a\":1}\n\n"}),
            ]
        });

        let response = h
            .orchestrator
            .handle(request("s4", "/v1beta/models/gemini-pro:streamGenerateContent"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "data: {\"a\":1}\n\n");
        assert_eq!(h.rotation.failure_count(), 0);
        assert_eq!(h.registry.pending_requests(), 0);
        peer.abort();
    }

    #[tokio::test]
    async fn test_pseudo_stream_sends_keepalives_while_waiting() {
        let mut h = harness(3, 0).await;
        let registry = h.registry.clone();
        let mut outbound = take_outbound(&mut h);
        let peer = tokio::spawn(async move {
            while let Some(text) = outbound.recv().await {
                let value: Value = serde_json::from_str(&text).unwrap();
                let id = value["request_id"].as_str().unwrap().to_string();
                tokio::time::sleep(Duration::from_millis(180)).await;
                registry.route(frame(serde_json::json!(
                    {"request_id": id, "event_type": "chunk", "data": "{}"})));
                registry.route(frame(serde_json::json!(
                    {"request_id": id, "event_type": "stream_close"})));
            }
        });

        let orchestrator = Arc::new(RequestOrchestrator::new(
            h.registry.clone(),
            h.rotation.clone(),
            StreamingMode::Fake,
            OrchestratorSettings {
                keepalive: Duration::from_millis(50),
                ..settings()
            },
        ));
        let response = orchestrator
            .handle(request("s5", "/v1beta/models/gemini-pro:streamGenerateContent"))
            .await;
        let body = body_text(response).await;

        assert!(body.starts_with(sse::KEEPALIVE_FRAME));
        assert!(body.matches(sse::KEEPALIVE_FRAME).count() >= 2);
        assert!(body.ends_with("data: {}\n\ndata: [DONE]\n\n"));
        peer.abort();
    }

    #[tokio::test]
    async fn test_lost_connection_after_grace_fails_request() {
        let h = harness(3, 0).await;
        let mut events = h.registry.subscribe();
        let (tx, mut outbound) = mpsc::unbounded_channel();
        let peer_id = h.registry.add_peer(tx);

        let registry = h.registry.clone();
        let dispatches = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peer = {
            let dispatches = dispatches.clone();
            tokio::spawn(async move {
                while outbound.recv().await.is_some() {
                    dispatches.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    registry.remove_peer(peer_id);
                }
            })
        };

        let response = h
            .orchestrator
            .handle(request("c1", "/v1beta/models/gemini-pro:generateContent"))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["error"]["code"], 503);

        // not retried, counted once
        assert_eq!(dispatches.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(h.rotation.failure_count(), 1);
        assert_eq!(h.registry.pending_requests(), 0);
        loop {
            match events.recv().await.unwrap() {
                ChannelEvent::ConnectionLost => break,
                ChannelEvent::PeerConnected => continue,
            }
        }
        peer.abort();
    }
}
