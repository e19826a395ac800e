//! # Swarm Events
//!
//! Event types streamed to callers while a pipeline runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Agent name used for orchestrator-level events
pub const SYSTEM_AGENT: &str = "system";

/// Kind of swarm event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SwarmEventKind {
    /// Pipeline started
    PipelineStarted,
    /// Human-readable progress line (stage banners, warnings)
    SystemMessage,
    StageStarted,
    StageCompleted,
    /// Agent started working
    AgentStarted,
    /// Chunk of streamed worker output
    AgentOutput,
    /// Agent completed successfully
    AgentCompleted,
    /// Agent failed
    AgentFailed,
    AgentCancelled,
    /// Agent served from the output cache
    CacheHit,
    /// VALIDATE confidence too low, rerunning once
    ValidationRerun,
    GuardrailRefused,
    EscalationCreated,
    /// Pipeline completed
    PipelineCompleted,
    /// Pipeline failed
    PipelineFailed,
    PipelineCancelled,
}

/// An event in the swarm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmEvent {
    /// Unique event ID
    pub id: String,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
    /// Kind of event
    pub kind: SwarmEventKind,
    /// Agent that produced this event
    pub agent: String,
    /// Associated data (JSON)
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl SwarmEvent {
    /// Create a new event
    pub fn new(kind: SwarmEventKind, agent: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            agent: agent.to_string(),
            data: None,
        }
    }

    /// System message from the orchestrator
    pub fn system(message: &str) -> Self {
        Self::new(SwarmEventKind::SystemMessage, SYSTEM_AGENT)
            .with_data(serde_json::json!({ "message": message }))
    }

    /// Add data to the event
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Message text for system messages
    pub fn message(&self) -> Option<&str> {
        self.data.as_ref()?.get("message")?.as_str()
    }
}

/// Optional outbound event channel, cheap to clone into agent tasks
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SwarmEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<SwarmEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that drops everything
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: SwarmEvent) {
        if let Some(tx) = &self.tx {
            // A closed receiver only means nobody is listening
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = SwarmEvent::new(SwarmEventKind::AgentStarted, "code-coder-0")
            .with_data(serde_json::json!({ "provider": "claude" }));

        assert_eq!(event.agent, "code-coder-0");
        assert_eq!(event.data.unwrap()["provider"], "claude");
    }

    #[test]
    fn test_system_message() {
        let event = SwarmEvent::system("Stage 1/6: RESEARCH");
        assert_eq!(event.kind, SwarmEventKind::SystemMessage);
        assert_eq!(event.message(), Some("Stage 1/6: RESEARCH"));
    }

    #[tokio::test]
    async fn test_sink_delivery_and_closed_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(tx);
        sink.emit(SwarmEvent::system("hello"));
        assert_eq!(rx.recv().await.unwrap().message(), Some("hello"));

        drop(rx);
        sink.emit(SwarmEvent::system("nobody listening"));
        EventSink::disabled().emit(SwarmEvent::system("dropped"));
    }
}
