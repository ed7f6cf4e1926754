//! WebSocket client driving one generation attempt.
//!
//! An attempt opens a single session, sends one `conversation.item.create`
//! message and then consumes image/error frames until one of the exit rules
//! fires:
//!
//! - enough final images were collected (early completion)
//! - the upstream signalled rate limiting
//! - medium output arrived but no final image followed in time (blocked)
//! - at least one final image exists and the session went quiet
//! - the hard attempt deadline expired
//! - the session closed or failed
//!
//! The state machine runs over any stream of [`Frame`]s, so recorded
//! transcripts can be replayed through [`ProtocolClient::run_on_stream`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use tokio::time::{Instant, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{
    ACCEPT_LANGUAGE, CACHE_CONTROL, COOKIE, ORIGIN, PRAGMA, USER_AGENT,
};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use crate::attempt::AttemptResult;
use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, Result};
use crate::http::install_rustls_provider;
use crate::message::{
    CreateItemRequest, Frame, InboundMessage, RATE_LIMIT_ERROR_CODE, UNAUTHORIZED_ERROR_CODE,
};
use crate::progress::{GenerationProgress, ImageProgress, ImageStage};
use crate::storage::{ImageSink, SavedImage};

/// Shorten a secret token for logging.
pub fn mask_token(token: &str) -> String {
    let prefix: String = token.chars().take(10).collect();
    format!("{prefix}...")
}

/// Parameters of one attempt.
#[derive(Debug, Clone)]
pub struct AttemptRequest {
    pub prompt: String,
    pub aspect_ratio: String,
    pub image_count: usize,
}

impl AttemptRequest {
    pub fn new(prompt: impl Into<String>, aspect_ratio: impl Into<String>, image_count: usize) -> Self {
        Self {
            prompt: prompt.into(),
            aspect_ratio: aspect_ratio.into(),
            image_count: image_count.max(1),
        }
    }
}

/// Receives accepted image deliveries while an attempt is running.
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    /// Errors are logged by the caller and never abort the attempt.
    async fn on_progress(&self, image: &ImageProgress, progress: &GenerationProgress) -> Result<()>;
}

/// Runs one generation attempt with one credential.
#[async_trait]
pub trait AttemptRunner: Send + Sync {
    async fn run_attempt(
        &self,
        token: &str,
        request: &AttemptRequest,
        observer: Option<&dyn ProgressObserver>,
    ) -> AttemptResult;
}

/// Why the receive loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LoopExit {
    /// `completed >= image_count`.
    Completed,
    /// Final images exist and the session went quiet.
    IdleCompleted,
    /// The hard deadline expired.
    Deadline,
    /// The peer closed the session.
    Closed,
    /// The transport failed mid-session.
    Transport(String),
    RateLimited(String),
    Blocked,
}

/// State of the receive loop for one attempt.
struct AttemptLoop<'a> {
    config: &'a ProtocolConfig,
    image_count: usize,
    progress: GenerationProgress,
    last_error: Option<(String, String)>,
    first_medium_at: Option<Instant>,
    last_activity: Instant,
    started: Instant,
}

impl<'a> AttemptLoop<'a> {
    fn new(config: &'a ProtocolConfig, image_count: usize) -> Self {
        let now = Instant::now();
        Self {
            config,
            image_count,
            progress: GenerationProgress::new(image_count),
            last_error: None,
            first_medium_at: None,
            last_activity: now,
            started: now,
        }
    }

    async fn run<S>(&mut self, mut frames: S, observer: Option<&dyn ProgressObserver>) -> LoopExit
    where
        S: Stream<Item = Result<Frame>> + Unpin,
    {
        loop {
            let elapsed = self.started.elapsed();
            if elapsed >= self.config.attempt_timeout {
                warn!(
                    elapsed_secs = elapsed.as_secs(),
                    completed = self.progress.completed(),
                    "Attempt deadline reached"
                );
                return LoopExit::Deadline;
            }
            let wait = self
                .config
                .idle_poll_interval
                .min(self.config.attempt_timeout - elapsed);

            match timeout(wait, frames.next()).await {
                Ok(Some(Ok(frame))) => {
                    if let Some(exit) = self.on_frame(frame, observer).await {
                        return exit;
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "WebSocket error");
                    return LoopExit::Transport(e.to_string());
                }
                Ok(None) => {
                    warn!("WebSocket stream closed");
                    return LoopExit::Closed;
                }
                Err(_) => {
                    if let Some(exit) = self.on_idle() {
                        return exit;
                    }
                }
            }
        }
    }

    async fn on_frame(
        &mut self,
        frame: Frame,
        observer: Option<&dyn ProgressObserver>,
    ) -> Option<LoopExit> {
        match frame {
            Frame::Message(message) => {
                self.last_activity = Instant::now();
                match message {
                    InboundMessage::Image { blob, url } => {
                        self.on_image(blob, url, observer).await;
                    }
                    InboundMessage::Error { err_code, err_msg } => {
                        warn!(code = %err_code, message = %err_msg, "Upstream error");
                        if err_code == RATE_LIMIT_ERROR_CODE {
                            return Some(LoopExit::RateLimited(err_msg));
                        }
                        self.last_error = Some((err_code, err_msg));
                    }
                    InboundMessage::Other => {}
                }
                self.after_message()
            }
            Frame::Malformed(reason) => {
                self.last_activity = Instant::now();
                debug!(reason = %reason, "Ignoring malformed frame");
                self.after_message()
            }
            Frame::Control => None,
            Frame::Closed => {
                warn!("WebSocket closed by peer");
                Some(LoopExit::Closed)
            }
        }
    }

    async fn on_image(&mut self, blob: String, url: String, observer: Option<&dyn ProgressObserver>) {
        if blob.is_empty() || url.is_empty() {
            return;
        }
        let Some(entry) = ImageProgress::from_delivery(blob, url, self.config) else {
            debug!("Image delivery without an image id, skipping");
            return;
        };

        if entry.stage == ImageStage::Medium && self.first_medium_at.is_none() {
            self.first_medium_at = Some(Instant::now());
        }

        let image_id = entry.image_id.clone();
        let upgraded = self
            .progress
            .get(&image_id)
            .is_none_or(|existing| entry.stage > existing.stage);
        if !self.progress.apply(entry) {
            return;
        }

        let Some(image) = self.progress.get(&image_id) else {
            return;
        };
        info!(
            image_id = %short_id(&image_id),
            stage = %image.stage,
            size = image.blob_size,
            completed = self.progress.completed(),
            total = self.image_count,
            "Image progress"
        );

        // Only stage upgrades are reported
        let Some(observer) = observer.filter(|_| upgraded) else {
            return;
        };
        let remaining = self
            .config
            .attempt_timeout
            .saturating_sub(self.started.elapsed());
        match timeout(remaining, observer.on_progress(image, &self.progress)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Progress observer failed"),
            Err(_) => warn!("Progress observer did not return before the attempt deadline"),
        }
    }

    /// Checks run after every text frame.
    fn after_message(&self) -> Option<LoopExit> {
        let completed = self.progress.completed();
        if completed >= self.image_count {
            info!(completed, "Collected all final images");
            return Some(LoopExit::Completed);
        }

        if completed == 0
            && let Some(medium_at) = self.first_medium_at
        {
            let since = medium_at.elapsed();
            if since > self.config.blocked_after_medium {
                warn!(
                    since_medium_secs = format!("{:.1}", since.as_secs_f64()),
                    "Blocked: medium received but no final image"
                );
                return Some(LoopExit::Blocked);
            }
        }
        None
    }

    /// Checks run when no frame arrived within the poll interval.
    fn on_idle(&self) -> Option<LoopExit> {
        let completed = self.progress.completed();

        if completed == 0
            && let Some(medium_at) = self.first_medium_at
        {
            let since = medium_at.elapsed();
            if since > self.config.idle_blocked_after_medium {
                warn!(
                    since_medium_secs = format!("{:.1}", since.as_secs_f64()),
                    "Blocked on idle: medium received but no final image"
                );
                return Some(LoopExit::Blocked);
            }
        }

        if completed > 0 && self.last_activity.elapsed() > self.config.idle_completion_after {
            info!(completed, "Session idle, finishing with collected images");
            return Some(LoopExit::IdleCompleted);
        }
        None
    }
}

fn short_id(image_id: &str) -> &str {
    image_id.get(..8).unwrap_or(image_id)
}

fn frame_from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::from_text(text.as_str()),
        Message::Close(_) => Frame::Closed,
        _ => Frame::Control,
    }
}

/// Client for the Imagine WebSocket endpoint.
pub struct ProtocolClient {
    config: ProtocolConfig,
    sink: Arc<dyn ImageSink>,
}

impl ProtocolClient {
    pub fn new(config: ProtocolConfig, sink: Arc<dyn ImageSink>) -> Self {
        Self { config, sink }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Build the upgrade request carrying the session credential.
    fn build_request(&self, token: &str) -> Result<Request> {
        let mut request = self
            .config
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::connection(format!("Invalid WebSocket URL: {e}")))?;

        let header = |value: &str| {
            HeaderValue::from_str(value)
                .map_err(|e| ProtocolError::protocol(format!("Invalid header value: {e}")))
        };

        let headers = request.headers_mut();
        headers.insert(COOKIE, header(&format!("sso={token}; sso-rw={token}"))?);
        headers.insert(ORIGIN, header(&self.config.origin)?);
        headers.insert(USER_AGENT, header(&self.config.user_agent)?);
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        Ok(request)
    }

    /// Run the attempt state machine over an already-open frame stream.
    pub async fn run_on_stream<S>(
        &self,
        frames: S,
        request: &AttemptRequest,
        observer: Option<&dyn ProgressObserver>,
    ) -> AttemptResult
    where
        S: Stream<Item = Result<Frame>> + Unpin,
    {
        let mut state = AttemptLoop::new(&self.config, request.image_count);
        let exit = state.run(frames, observer).await;
        self.finish(exit, state).await
    }

    /// Persist what was collected and classify the attempt.
    async fn finish(&self, exit: LoopExit, state: AttemptLoop<'_>) -> AttemptResult {
        match exit {
            LoopExit::RateLimited(message) => return AttemptResult::RateLimited { message },
            LoopExit::Blocked => return AttemptResult::blocked(),
            _ => {}
        }

        let saved = self.persist(&state.progress, state.image_count).await;
        if !saved.is_empty() {
            if exit == LoopExit::Deadline {
                return AttemptResult::Timeout {
                    partial_images: saved,
                };
            }
            return AttemptResult::Success { images: saved };
        }

        if let Some((code, message)) = state.last_error {
            return match code.as_str() {
                RATE_LIMIT_ERROR_CODE => AttemptResult::RateLimited { message },
                UNAUTHORIZED_ERROR_CODE => AttemptResult::Unauthorized { message },
                _ => AttemptResult::Upstream { code, message },
            };
        }

        if state.progress.is_blocked() {
            return AttemptResult::blocked();
        }

        match exit {
            LoopExit::Transport(message) => AttemptResult::ConnectionError { message },
            LoopExit::Deadline => AttemptResult::Timeout {
                partial_images: Vec::new(),
            },
            _ => AttemptResult::NoImageData,
        }
    }

    /// Save the best delivery per image id, at most `limit` images.
    ///
    /// A failed save drops that image only.
    async fn persist(&self, progress: &GenerationProgress, limit: usize) -> Vec<SavedImage> {
        let mut saved = Vec::new();
        for image in progress.best_images(progress.len()) {
            if saved.len() >= limit {
                break;
            }
            match self.sink.save(image).await {
                Ok(image) => saved.push(image),
                Err(e) => {
                    error!(image_id = %short_id(&image.image_id), error = %e, "Failed to save image")
                }
            }
        }
        saved
    }
}

#[async_trait]
impl AttemptRunner for ProtocolClient {
    async fn run_attempt(
        &self,
        token: &str,
        request: &AttemptRequest,
        observer: Option<&dyn ProgressObserver>,
    ) -> AttemptResult {
        install_rustls_provider();

        let upgrade = match self.build_request(token) {
            Ok(upgrade) => upgrade,
            Err(e) => {
                return AttemptResult::ConnectionError {
                    message: e.to_string(),
                };
            }
        };

        info!(url = %self.config.ws_url, token = %mask_token(token), "Connecting to WebSocket");
        let ws_stream = match connect_async(upgrade).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(WsError::Http(response)) => {
                let status = response.status();
                warn!(status = %status, "WebSocket handshake rejected");
                let message = format!("handshake rejected with HTTP {status}");
                return match status.as_u16() {
                    401 | 403 => AttemptResult::Unauthorized { message },
                    429 => AttemptResult::RateLimited { message },
                    _ => AttemptResult::ConnectionError { message },
                };
            }
            Err(e) => {
                error!(error = %e, "WebSocket connection failed");
                return AttemptResult::ConnectionError {
                    message: format!("connection failed: {e}"),
                };
            }
        };

        let (mut sender, receiver) = ws_stream.split();

        let message = CreateItemRequest::new(
            &request.prompt,
            &request.aspect_ratio,
            self.config.enable_nsfw,
        );
        let payload = match serde_json::to_string(&message) {
            Ok(payload) => payload,
            Err(e) => {
                return AttemptResult::ConnectionError {
                    message: format!("failed to encode request: {e}"),
                };
            }
        };
        if let Err(e) = sender.send(Message::text(payload)).await {
            error!(error = %e, "Failed to send generation request");
            return AttemptResult::ConnectionError {
                message: format!("failed to send request: {e}"),
            };
        }
        let prompt_preview: String = request.prompt.chars().take(50).collect();
        info!(
            request_id = %message.request_id(),
            prompt = %prompt_preview,
            image_count = request.image_count,
            "Sent generation request"
        );

        let frames = receiver.map(|item| {
            item.map(frame_from_message)
                .map_err(|e| ProtocolError::connection(e.to_string()))
        });
        let result = self.run_on_stream(frames, request, observer).await;

        if let Err(e) = sender.close().await {
            debug!(error = %e, "WebSocket close failed");
        }
        result
    }
}
