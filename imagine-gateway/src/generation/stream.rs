//! Progress-event stream over one generation.
//!
//! A spawned task runs [`Generator::generate`] and pushes every accepted
//! image delivery into a bounded channel, followed by exactly one terminal
//! result. Dropping or cancelling the [`GenerationStream`] cancels the task,
//! which drops the in-flight attempt and closes its WebSocket session.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use imagine_protocol::{GenerationProgress, ImageProgress, ImageStage, ProgressObserver, ProtocolError};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::orchestrator::Generator;
use super::outcome::{GenerationError, GenerationOutcome};
use super::request::GenerationRequest;

/// Capacity of the hand-off channel between the generation task and the consumer.
pub const STREAM_CHANNEL_CAPACITY: usize = 32;

/// One accepted image delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub image_id: String,
    pub stage: ImageStage,
    pub blob_size: usize,
    pub is_final: bool,
    /// Final images collected so far in this attempt.
    pub completed: usize,
    pub total: usize,
}

impl ProgressEvent {
    fn new(image: &ImageProgress, progress: &GenerationProgress) -> Self {
        Self {
            image_id: image.image_id.clone(),
            stage: image.stage,
            blob_size: image.blob_size,
            is_final: image.is_final,
            completed: progress.completed(),
            total: progress.total,
        }
    }
}

/// Event delivered to the consumer.
#[derive(Debug)]
pub enum StreamEvent {
    Progress(ProgressEvent),
    /// Terminal event; nothing follows it.
    Result(GenerationOutcome),
}

/// Forwards progress into the stream channel.
struct ChannelObserver {
    tx: mpsc::Sender<StreamEvent>,
}

#[async_trait]
impl ProgressObserver for ChannelObserver {
    async fn on_progress(
        &self,
        image: &ImageProgress,
        progress: &GenerationProgress,
    ) -> imagine_protocol::Result<()> {
        self.tx
            .send(StreamEvent::Progress(ProgressEvent::new(image, progress)))
            .await
            .map_err(|_| ProtocolError::other("stream consumer went away"))
    }
}

/// Consumer side of a streaming generation.
pub struct GenerationStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl GenerationStream {
    /// Wait for the next event. `None` once the result was delivered or the task ended.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Wait at most `wait` for the next event.
    ///
    /// Lets the consumer check for its own cancellation between polls.
    pub async fn next_event_timeout(
        &mut self,
        wait: Duration,
    ) -> Result<Option<StreamEvent>, Elapsed> {
        tokio::time::timeout(wait, self.rx.recv()).await
    }

    /// Cancel the generation task. Pending events are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel and wait until the generation task has finished.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.rx.close();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Drain progress events and return the terminal outcome.
    pub async fn into_outcome(mut self) -> GenerationOutcome {
        while let Some(event) = self.next_event().await {
            if let StreamEvent::Result(outcome) = event {
                return outcome;
            }
        }
        Err(GenerationError::AllRetriesFailed)
    }
}

impl Stream for GenerationStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Generator {
    /// Run `request` on a background task and stream its progress.
    pub fn generate_stream(self: &Arc<Self>, request: GenerationRequest) -> GenerationStream {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let generator = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let observer = ChannelObserver { tx: tx.clone() };

            let outcome = tokio::select! {
                _ = task_cancel.cancelled() => {
                    info!("Streaming generation cancelled");
                    return;
                }
                outcome = generator.generate(&request, Some(&observer)) => outcome,
            };

            tokio::select! {
                _ = task_cancel.cancelled() => {
                    debug!("Stream cancelled before the result was delivered");
                }
                sent = tx.send(StreamEvent::Result(outcome)) => {
                    if sent.is_err() {
                        debug!("Stream consumer dropped before the result");
                    }
                }
            }
        });

        GenerationStream {
            rx,
            cancel,
            handle: Some(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::StreamExt;
    use imagine_protocol::{
        AttemptRequest, AttemptResult, AttemptRunner, NoopAgeVerifier, ProtocolConfig,
    };
    use tokio::sync::Notify;

    use crate::credentials::{
        CredentialPool, KvCredentialStore, ManualClock, MemoryKv, PoolConfig, RotationStrategy,
    };
    use crate::generation::{GenerationDefaults, RetryPolicy};

    const ID_A: &str = "aaaaaaaa-0000-4000-8000-000000000001";

    fn delivery(id: &str, ext: &str, len: usize) -> ImageProgress {
        ImageProgress::from_delivery(
            "A".repeat(len),
            format!("https://assets.grok.com/images/{id}.{ext}"),
            &ProtocolConfig::default(),
        )
        .unwrap()
    }

    /// Emits preview, medium and final for one image, then succeeds.
    struct ProgressiveRunner;

    #[async_trait]
    impl AttemptRunner for ProgressiveRunner {
        async fn run_attempt(
            &self,
            _token: &str,
            request: &AttemptRequest,
            observer: Option<&dyn ProgressObserver>,
        ) -> AttemptResult {
            let mut progress = GenerationProgress::new(request.image_count);
            for (ext, len) in [("png", 5_000), ("png", 50_000), ("jpg", 150_000)] {
                let entry = delivery(ID_A, ext, len);
                progress.apply(entry.clone());
                if let Some(observer) = observer {
                    let _ = observer.on_progress(&entry, &progress).await;
                }
            }
            AttemptResult::Success { images: vec![] }
        }
    }

    /// Marks its session closed when the attempt future is dropped.
    struct SessionGuard {
        closed: Arc<AtomicBool>,
        notify: Arc<Notify>,
    }

    impl Drop for SessionGuard {
        fn drop(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    /// Holds a session open forever.
    struct HangingRunner {
        started: Arc<Notify>,
        closed: Arc<AtomicBool>,
        dropped: Arc<Notify>,
    }

    #[async_trait]
    impl AttemptRunner for HangingRunner {
        async fn run_attempt(
            &self,
            _token: &str,
            _request: &AttemptRequest,
            _observer: Option<&dyn ProgressObserver>,
        ) -> AttemptResult {
            let _session = SessionGuard {
                closed: self.closed.clone(),
                notify: self.dropped.clone(),
            };
            self.started.notify_one();
            std::future::pending::<()>().await;
            AttemptResult::NoImageData
        }
    }

    async fn pool() -> Arc<CredentialPool> {
        let store = Arc::new(KvCredentialStore::new(MemoryKv::new(), "sso:"));
        let config = PoolConfig {
            strategy: RotationStrategy::Hybrid,
            daily_limit: 10,
            source: None,
        };
        let pool = Arc::new(CredentialPool::new(
            config,
            store,
            Arc::new(ManualClock::new(1_700_000_000)),
        ));
        pool.load("token-a\ntoken-b\n").await.unwrap();
        pool
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("a city in fog", &GenerationDefaults::default()).with_image_count(1)
    }

    #[tokio::test]
    async fn test_progress_events_then_single_result() {
        let generator = Arc::new(Generator::new(
            pool().await,
            Arc::new(ProgressiveRunner),
            Arc::new(NoopAgeVerifier),
            RetryPolicy::default(),
        ));

        let events: Vec<StreamEvent> = generator.generate_stream(request()).collect().await;

        assert_eq!(events.len(), 4);
        let stages: Vec<ImageStage> = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::Progress(p) => Some(p.stage),
                StreamEvent::Result(_) => None,
            })
            .collect();
        assert_eq!(
            stages,
            vec![ImageStage::Preview, ImageStage::Medium, ImageStage::Final]
        );
        match events.last() {
            Some(StreamEvent::Progress(_)) | None => panic!("missing terminal result"),
            Some(StreamEvent::Result(outcome)) => assert!(outcome.is_ok()),
        }
        if let StreamEvent::Progress(last) = &events[2] {
            assert!(last.is_final);
            assert_eq!((last.completed, last.total), (1, 1));
        }
    }

    #[tokio::test]
    async fn test_cancel_tears_down_session_and_releases_pool() {
        let pool = pool().await;
        let started = Arc::new(Notify::new());
        let dropped = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));
        let runner = Arc::new(HangingRunner {
            started: started.clone(),
            closed: closed.clone(),
            dropped: dropped.clone(),
        });
        let generator = Arc::new(Generator::new(
            pool.clone(),
            runner,
            Arc::new(NoopAgeVerifier),
            RetryPolicy::default(),
        ));

        let mut stream = generator.generate_stream(request());
        started.notified().await;
        assert!(
            stream
                .next_event_timeout(Duration::from_millis(20))
                .await
                .is_err()
        );

        stream.shutdown().await;

        assert!(closed.load(Ordering::SeqCst));
        // Pool lock is free and no credential was left marked
        let status = tokio::time::timeout(Duration::from_secs(1), pool.status())
            .await
            .expect("pool lock released")
            .unwrap();
        assert_eq!(status.failed_count, 0);
        assert!(status.keys.iter().all(|k| k.used_today == 0));
    }

    #[tokio::test]
    async fn test_drop_cancels_generation() {
        let started = Arc::new(Notify::new());
        let dropped = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));
        let runner = Arc::new(HangingRunner {
            started: started.clone(),
            closed: closed.clone(),
            dropped: dropped.clone(),
        });
        let generator = Arc::new(Generator::new(
            pool().await,
            runner,
            Arc::new(NoopAgeVerifier),
            RetryPolicy::default(),
        ));

        let stream = generator.generate_stream(request());
        started.notified().await;
        drop(stream);

        tokio::time::timeout(Duration::from_secs(1), dropped.notified())
            .await
            .expect("session dropped after stream drop");
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_into_outcome_skips_progress() {
        let generator = Arc::new(Generator::new(
            pool().await,
            Arc::new(ProgressiveRunner),
            Arc::new(NoopAgeVerifier),
            RetryPolicy::default(),
        ));
        let outcome = generator.generate_stream(request()).into_outcome().await;
        assert_eq!(outcome.unwrap().attempts, 1);
    }

    #[test]
    fn test_progress_event_json() {
        let event = ProgressEvent {
            image_id: ID_A.to_string(),
            stage: ImageStage::Medium,
            blob_size: 42_000,
            is_final: false,
            completed: 0,
            total: 4,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["stage"], "medium");
        assert_eq!(json["total"], 4);
    }
}
