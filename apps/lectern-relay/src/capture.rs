use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use lectern_proto::{JsonObject, ServerFrame, StudentEvent};

use crate::hub::Hub;
use crate::session::EnqueueOutcome;

/// A frame older than this no longer reflects the student's screen, so it is
/// shed rather than delivered late.
const STALE_CAPTURE_AGE: Duration = Duration::from_secs(2);

/// Recompression backend for capture frames. `image` is the data-URL string
/// produced by the extension; implementations return the replacement string.
pub trait CaptureCompressor: Send + Sync {
    fn compress(&self, image: &str, quality: u8) -> Result<String, CompressError>;
}

/// Error surfaced by a capture compression backend.
#[derive(Debug, Error)]
#[error("capture compression failed: {0}")]
pub struct CompressError(pub String);

/// Latest-wins delivery path for screen captures. Frames skip the hub's
/// request queue and go straight to the teacher's outbox; a full outbox sheds
/// the frame silently because a newer one is always coming.
#[derive(Clone)]
pub struct CaptureRelay {
    hub: Hub,
    recompress: Option<(Arc<dyn CaptureCompressor>, u8)>,
}

impl CaptureRelay {
    /// Blind relay: capture payloads pass through byte-for-byte.
    pub fn new(hub: Hub) -> Self {
        Self {
            hub,
            recompress: None,
        }
    }

    /// Relay with recompression: each frame's `imageData` is rewritten by
    /// `compressor` off the async runtime before delivery.
    pub fn with_compressor(hub: Hub, compressor: Arc<dyn CaptureCompressor>, quality: u8) -> Self {
        Self {
            hub,
            recompress: Some((compressor, quality)),
        }
    }

    /// Hands one capture frame toward the teacher. Never blocks the caller.
    pub fn forward(&self, client_id: String, data: JsonObject) {
        match &self.recompress {
            Some((compressor, quality)) => {
                self.forward_recompressed(client_id, data, Arc::clone(compressor), *quality)
            }
            None => self.deliver(client_id, data),
        }
    }

    fn forward_recompressed(
        &self,
        client_id: String,
        mut data: JsonObject,
        compressor: Arc<dyn CaptureCompressor>,
        quality: u8,
    ) {
        let Some(image) = data.get("imageData").and_then(Value::as_str).map(str::to_owned)
        else {
            warn!(client_id = %client_id, "capture frame has no imageData, dropping");
            return;
        };
        let relay = self.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let input = image.clone();
            let compressed =
                tokio::task::spawn_blocking(move || compressor.compress(&input, quality)).await;
            let image = match compressed {
                Ok(Ok(smaller)) => smaller,
                Ok(Err(err)) => {
                    warn!(error = %err, "capture compression failed, relaying original");
                    counter!("lectern_capture_compress_failures_total", 1);
                    image
                }
                Err(err) => {
                    warn!(error = %err, "capture compression task aborted, relaying original");
                    image
                }
            };
            if started.elapsed() > STALE_CAPTURE_AGE {
                debug!(client_id = %client_id, "capture frame went stale during compression");
                counter!("lectern_capture_stale_total", 1);
                return;
            }
            data.insert("imageData".to_string(), Value::String(image));
            relay.deliver(client_id, data);
        });
    }

    fn deliver(&self, client_id: String, data: JsonObject) {
        let Some(teacher) = self.hub.current_teacher() else {
            // Nobody is watching; shed the frame at the source.
            return;
        };
        let frame = ServerFrame::StudentCaptureFrame {
            data: StudentEvent {
                client_id,
                payload: Value::Object(data),
            },
        };
        match serde_json::to_string(&frame) {
            Ok(json) => match teacher.enqueue(json) {
                EnqueueOutcome::Sent => counter!("lectern_captures_relayed_total", 1),
                EnqueueOutcome::Full => {
                    counter!("lectern_capture_drops_total", 1);
                    debug!("teacher outbox full, shedding capture frame");
                }
                EnqueueOutcome::Closed => {}
            },
            Err(err) => warn!(error = %err, "failed to serialize capture frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::hub::RouteTarget;
    use crate::session::Session;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn recv_json(rx: &mut mpsc::Receiver<String>) -> Value {
        let frame = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbox closed while waiting for frame");
        serde_json::from_str(&frame).expect("frame is not valid JSON")
    }

    async fn watching_teacher(hub: &Hub) -> (Arc<Session>, mpsc::Receiver<String>) {
        let (teacher, mut rx) = Session::new(16);
        assert!(teacher.assign_teacher());
        hub.register(Arc::clone(&teacher)).await;
        let roster = recv_json(&mut rx).await;
        assert_eq!(roster["type"], "initial_roster");
        (teacher, rx)
    }

    fn capture_payload() -> JsonObject {
        let mut data = JsonObject::new();
        data.insert("tabId".into(), json!(7));
        data.insert("imageData".into(), json!("data:image/jpeg;base64,original"));
        data.insert("capturedAt".into(), json!(1_724_400_000_000_u64));
        data
    }

    #[tokio::test]
    async fn blind_relay_preserves_payload() {
        let hub = Hub::new(&RelayConfig::default());
        let (_teacher, mut teacher_rx) = watching_teacher(&hub).await;

        let relay = CaptureRelay::new(hub);
        relay.forward("s-1".to_string(), capture_payload());

        let frame = recv_json(&mut teacher_rx).await;
        assert_eq!(frame["type"], "student_capture_frame");
        assert_eq!(frame["data"]["clientId"], "s-1");
        assert_eq!(frame["data"]["payload"]["tabId"], 7);
        assert_eq!(
            frame["data"]["payload"]["imageData"],
            "data:image/jpeg;base64,original"
        );
        assert_eq!(frame["data"]["payload"]["capturedAt"], 1_724_400_000_000_u64);
    }

    #[tokio::test]
    async fn frames_without_a_teacher_are_shed() {
        let hub = Hub::new(&RelayConfig::default());
        let relay = CaptureRelay::new(hub.clone());
        relay.forward("s-1".to_string(), capture_payload());

        // A teacher joining afterwards sees nothing buffered.
        let (_teacher, mut teacher_rx) = watching_teacher(&hub).await;
        hub.route_control(RouteTarget::Teacher, json!({"probe": 1}).to_string()).await;
        let next = recv_json(&mut teacher_rx).await;
        assert_eq!(next["probe"], 1);
    }

    struct Shrinking;

    impl CaptureCompressor for Shrinking {
        fn compress(&self, _image: &str, quality: u8) -> Result<String, CompressError> {
            Ok(format!("compressed-q{quality}"))
        }
    }

    struct Failing;

    impl CaptureCompressor for Failing {
        fn compress(&self, _image: &str, _quality: u8) -> Result<String, CompressError> {
            Err(CompressError("backend unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn compressor_rewrites_image_data_only() {
        let hub = Hub::new(&RelayConfig::default());
        let (_teacher, mut teacher_rx) = watching_teacher(&hub).await;

        let relay = CaptureRelay::with_compressor(hub, Arc::new(Shrinking), 40);
        relay.forward("s-1".to_string(), capture_payload());

        let frame = recv_json(&mut teacher_rx).await;
        assert_eq!(frame["data"]["payload"]["imageData"], "compressed-q40");
        assert_eq!(frame["data"]["payload"]["tabId"], 7);
        assert_eq!(frame["data"]["payload"]["capturedAt"], 1_724_400_000_000_u64);
    }

    #[tokio::test]
    async fn failed_compression_relays_the_original_image() {
        let hub = Hub::new(&RelayConfig::default());
        let (_teacher, mut teacher_rx) = watching_teacher(&hub).await;

        let relay = CaptureRelay::with_compressor(hub, Arc::new(Failing), 40);
        relay.forward("s-1".to_string(), capture_payload());

        let frame = recv_json(&mut teacher_rx).await;
        assert_eq!(
            frame["data"]["payload"]["imageData"],
            "data:image/jpeg;base64,original"
        );
    }

    #[tokio::test]
    async fn recompression_requires_image_data() {
        let hub = Hub::new(&RelayConfig::default());
        let (_teacher, mut teacher_rx) = watching_teacher(&hub).await;

        let relay = CaptureRelay::with_compressor(hub.clone(), Arc::new(Shrinking), 40);
        let mut data = JsonObject::new();
        data.insert("tabId".into(), json!(7));
        relay.forward("s-1".to_string(), data);

        hub.route_control(RouteTarget::Teacher, json!({"probe": 2}).to_string()).await;
        let next = recv_json(&mut teacher_rx).await;
        assert_eq!(next["probe"], 2);
    }
}
