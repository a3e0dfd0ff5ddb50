//! Real-time event bus.
//!
//! Producers (worker thread, model loader, job store) hand pre-serialized
//! frames to a broadcast channel; every WebSocket connection owns its own
//! receiver, so a slow client never blocks a producer or another client.
//! Two hot event kinds are rate-limited by dropping: `job_progress` (one
//! per 100 ms) and `job_preview` (one per 200 ms). Dropped progress is
//! still observable by polling; previews are still retrievable over HTTP.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};
use strum::AsRefStr;
use tokio::sync::{broadcast, watch};

const PROGRESS_THROTTLE: Duration = Duration::from_millis(100);
const PREVIEW_THROTTLE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    // Job lifecycle
    JobAdded,
    JobStatusChanged,
    JobProgress,
    JobPreview,
    JobCancelled,
    JobDeleted,
    JobRestored,
    // Model lifecycle
    ModelLoadingProgress,
    ModelLoaded,
    ModelLoadFailed,
    ModelUnloaded,
    // Upscaler
    UpscalerLoaded,
    UpscalerUnloaded,
    // Server
    ServerStatus,
    Pong,
}

/// Supplies the `server_status` payload for new connections and
/// `get_status` requests.
pub type StatusProvider = Arc<dyn Fn() -> Value + Send + Sync>;

#[derive(Debug, Default)]
struct Throttle {
    last_progress: Option<Instant>,
    last_preview: Option<Instant>,
}

pub struct EventBus {
    tx: broadcast::Sender<Arc<str>>,
    throttle: Mutex<Throttle>,
    status_provider: RwLock<Option<StatusProvider>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    /// `capacity` bounds each subscriber's backlog; a receiver that lags
    /// past it is disconnected by its WebSocket task.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            tx,
            throttle: Mutex::new(Throttle::default()),
            status_provider: RwLock::new(None),
            shutdown_tx,
        }
    }

    /// Broadcast an event to every subscriber. Non-blocking; callable from
    /// any thread. Returns `true` when the frame was actually sent (false
    /// when throttled away).
    pub fn broadcast(&self, kind: EventKind, data: Value) -> bool {
        {
            let mut throttle = self.throttle.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            match kind {
                EventKind::JobProgress => {
                    if throttle
                        .last_progress
                        .is_some_and(|t| now.duration_since(t) < PROGRESS_THROTTLE)
                    {
                        return false;
                    }
                    throttle.last_progress = Some(now);
                }
                EventKind::JobPreview => {
                    if throttle
                        .last_preview
                        .is_some_and(|t| now.duration_since(t) < PREVIEW_THROTTLE)
                    {
                        return false;
                    }
                    throttle.last_preview = Some(now);
                }
                _ => {}
            }
        }

        let frame: Arc<str> = Arc::from(envelope(kind, data));
        // No subscribers is not an error.
        let _ = self.tx.send(frame);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn set_status_provider(&self, provider: StatusProvider) {
        *self
            .status_provider
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(provider);
    }

    /// Current server status from the registered provider, or `{}`.
    pub fn snapshot_status(&self) -> Value {
        self.status_provider
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|p| p())
            .unwrap_or_else(|| json!({}))
    }

    /// Ready-to-send `server_status` frame for a single connection.
    pub fn server_status_frame(&self) -> String {
        envelope(EventKind::ServerStatus, self.snapshot_status())
    }

    pub fn pong_frame(&self) -> String {
        envelope(EventKind::Pong, json!({}))
    }

    /// Flag the bus as stopping. Safe to call from a signal path; does not
    /// wait for subscribers.
    pub fn request_stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// `{event, timestamp, data}`: the wire envelope every frame uses.
pub fn envelope(kind: EventKind, data: Value) -> String {
    json!({
        "event": kind.as_ref(),
        "timestamp": timestamp_now(),
        "data": data,
    })
    .to_string()
}

/// ISO-8601 UTC with millisecond precision.
fn timestamp_now() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn envelope_shape() {
        let frame = envelope(EventKind::JobAdded, json!({"job_id": "x"}));
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["event"], "job_added");
        assert_eq!(v["data"]["job_id"], "x");
        let ts = v["timestamp"].as_str().unwrap();
        assert!(ts.ends_with('Z') && ts.contains('.'), "bad timestamp: {ts}");
    }

    #[test]
    fn kinds_serialize_snake_case() {
        assert_eq!(EventKind::ModelLoadingProgress.as_ref(), "model_loading_progress");
        assert_eq!(EventKind::JobStatusChanged.as_ref(), "job_status_changed");
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.broadcast(EventKind::JobAdded, json!({"n": 1}));
        bus.broadcast(EventKind::JobCancelled, json!({"n": 2}));

        let a: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        let b: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(a["event"], "job_added");
        assert_eq!(b["event"], "job_cancelled");
    }

    #[tokio::test]
    async fn progress_events_are_throttled() {
        let bus = EventBus::new(16);
        let _rx = bus.subscribe();
        assert!(bus.broadcast(EventKind::JobProgress, json!({"step": 1})));
        assert!(!bus.broadcast(EventKind::JobProgress, json!({"step": 2})));
        // Other kinds are unaffected by the progress window.
        assert!(bus.broadcast(EventKind::JobStatusChanged, json!({})));
    }

    #[test]
    fn status_provider_feeds_snapshot() {
        let bus = EventBus::new(4);
        bus.set_status_provider(Arc::new(|| json!({"model_loaded": false})));
        assert_eq!(bus.snapshot_status()["model_loaded"], false);
        let frame: Value = serde_json::from_str(&bus.server_status_frame()).unwrap();
        assert_eq!(frame["event"], "server_status");
    }
}
