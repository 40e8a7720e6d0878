//! Progress events streamed to the client over SSE.
//!
//! Each event serializes as one JSON object with the variant name inlined as
//! a `type` discriminator, exactly as it appears on the wire in a
//! `data: <JSON>` frame. Per job there is a single unbounded channel whose
//! sole consumer is the SSE writer, so event writes are serialized without
//! any extra locking; the pipeline task, the heartbeat ticker, and the
//! log-tail poller all hold clones of the sending half.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::JobMetrics;

/// Which stage a streamed log line belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogPhase {
    Install,
    Build,
}

impl LogPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Build => "build",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SseEvent {
    JobCreated { job_id: String },
    Generating,
    Generated { file_count: usize },
    Scaffolding,
    Writing,
    Installing,
    Building,
    Deploying,
    Deployed { deployed_url: String },
    Log { phase: LogPhase, message: String },
    Complete {
        preview_url: String,
        deployed_url: String,
        metrics: JobMetrics,
    },
    Error { message: String },
}

impl SseEvent {
    /// True for the two events that terminate a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

/// Cloneable sending handle for a job's event stream. Sends are best-effort:
/// once the client disconnects the receiver is gone and events are dropped,
/// while the pipeline keeps running to preserve durable job state.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SseEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SseEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: SseEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_discriminator_is_inlined() {
        let event = SseEvent::JobCreated {
            job_id: "job_a1b2c3d4".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_created");
        assert_eq!(json["jobId"], "job_a1b2c3d4");
    }

    #[test]
    fn test_bare_stage_events_serialize_to_type_only() {
        let json = serde_json::to_string(&SseEvent::Generating).unwrap();
        assert_eq!(json, r#"{"type":"generating"}"#);
    }

    #[test]
    fn test_log_event_phase_is_lowercase() {
        let event = SseEvent::Log {
            phase: LogPhase::Install,
            message: "resolved 12 packages".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["phase"], "install");
    }

    #[test]
    fn test_complete_event_fields_are_camel_case() {
        let event = SseEvent::Complete {
            preview_url: "https://nimbus-a1b2c3d4.workers.dev".to_string(),
            deployed_url: "https://nimbus-a1b2c3d4.workers.dev".to_string(),
            metrics: JobMetrics::default(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "complete");
        assert!(json["previewUrl"].is_string());
        assert!(json["deployedUrl"].is_string());
        assert!(json["metrics"]["fileCount"].is_number());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(SseEvent::Error { message: "x".into() }.is_terminal());
        assert!(
            SseEvent::Complete {
                preview_url: String::new(),
                deployed_url: String::new(),
                metrics: JobMetrics::default(),
            }
            .is_terminal()
        );
        assert!(!SseEvent::Deploying.is_terminal());
    }

    #[tokio::test]
    async fn test_sink_drops_events_after_receiver_is_gone() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        // Must not panic or error; the pipeline continues after disconnect.
        sink.send(SseEvent::Generating);
    }

    #[tokio::test]
    async fn test_sink_preserves_order_across_clones() {
        let (sink, mut rx) = EventSink::channel();
        let clone = sink.clone();
        sink.send(SseEvent::Generating);
        clone.send(SseEvent::Generated { file_count: 3 });
        drop(sink);
        drop(clone);
        assert_eq!(rx.recv().await, Some(SseEvent::Generating));
        assert_eq!(rx.recv().await, Some(SseEvent::Generated { file_count: 3 }));
        assert_eq!(rx.recv().await, None);
    }
}
