use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Severity tags understood by the admin log stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Success,
    Error,
    Progress,
}

/// One structured entry on the agent event stream. The worker and pipeline
/// publish these; the SSE endpoint and the store-backed replay buffer
/// consume them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub timestamp: String,
    pub level: EventLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl AgentEvent {
    pub fn new(level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            level,
            message: message.into(),
            progress: None,
        }
    }

    pub fn progress(pct: u8, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            level: EventLevel::Progress,
            message: message.into(),
            progress: Some(pct.min(100)),
        }
    }
}

/// Fan-out handle for agent events. Cloneable; dropped receivers are fine.
#[derive(Clone)]
pub struct EventSink {
    tx: tokio::sync::broadcast::Sender<AgentEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event); // Ignored if no receivers
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(AgentEvent::new(EventLevel::Info, message));
    }

    pub fn success(&self, message: impl Into<String>) {
        self.emit(AgentEvent::new(EventLevel::Success, message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(AgentEvent::new(EventLevel::Error, message));
    }

    pub fn report_progress(&self, pct: u8, message: impl Into<String>) {
        self.emit(AgentEvent::progress(pct, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let sink = EventSink::new(16);
        let mut rx = sink.subscribe();
        sink.info("discovery started");
        sink.report_progress(10, "starting");
        let first = rx.recv().await.unwrap();
        assert_eq!(first.level, EventLevel::Info);
        assert_eq!(first.message, "discovery started");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.progress, Some(10));
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_silent() {
        let sink = EventSink::new(4);
        sink.error("nobody listening");
    }

    #[test]
    fn progress_is_clamped() {
        let ev = AgentEvent::progress(150, "overflow");
        assert_eq!(ev.progress, Some(100));
    }

    #[test]
    fn serializes_with_lowercase_level() {
        let ev = AgentEvent::new(EventLevel::Success, "done");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"level\":\"success\""));
        assert!(!json.contains("progress"));
    }
}
