//! Client notifications
//!
//! Every job produces progress events and exactly one terminal event. Events
//! go to the requester's session channel and to the per-user channel.

use crate::job::{ChatRecord, Job};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const MSG_ANALYZING_TREE: &str = "Analyzing repository file structure...";
pub const MSG_READING_FILES: &str = "Reading file contents...";
pub const MSG_GENERATING: &str = "Generating code changes...";

/// Serialized as `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Progress message
    AgentResponse { message: String },
    PrSubmitted {
        pr_url: String,
        session: Option<String>,
        chat: ChatRecord,
    },
    /// `pr_url` carries the failure message
    AgentError {
        pr_url: String,
        session: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        chat: Option<ChatRecord>,
    },
}

impl AgentEvent {
    pub fn progress(message: &str) -> Self {
        AgentEvent::AgentResponse {
            message: message.to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::AgentResponse { .. } => "agent_response",
            AgentEvent::PrSubmitted { .. } => "pr_submitted",
            AgentEvent::AgentError { .. } => "agent_error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AgentEvent::AgentResponse { .. })
    }
}

/// An event addressed to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub channel: String,
    #[serde(flatten)]
    pub event: AgentEvent,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn emit(&self, channel: &str, event: &AgentEvent) -> anyhow::Result<()>;
}

/// Send `event` to every channel of `job`. Delivery is best-effort.
pub async fn emit_to_job(notifier: &dyn Notifier, job: &Job, event: &AgentEvent) {
    for channel in job.channels() {
        if let Err(e) = notifier.emit(&channel, event).await {
            warn!(channel = %channel, event = event.name(), "failed to deliver event: {}", e);
        }
    }
}

/// Progress messages only go to the requester's session channel.
pub async fn emit_progress(notifier: &dyn Notifier, job: &Job, message: &str) {
    let channel = &job.entry.socket_id;
    if channel.is_empty() {
        return;
    }
    if let Err(e) = notifier.emit(channel, &AgentEvent::progress(message)).await {
        debug!(channel = %channel, "failed to deliver progress: {}", e);
    }
}

/// Fans events out to in-process subscribers.
#[derive(Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn emit(&self, channel: &str, event: &AgentEvent) -> anyhow::Result<()> {
        // No subscribers is not a delivery failure.
        let _ = self.sender.send(Notification {
            channel: channel.to_string(),
            event: event.clone(),
        });
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingNotifier;
    use super::*;
    use crate::job::fixtures;

    #[test]
    fn test_event_wire_format() {
        let event = AgentEvent::PrSubmitted {
            pr_url: "https://github.com/acme/widgets/pull/1".to_string(),
            session: Some("s-1".to_string()),
            chat: ChatRecord {
                pull_request_url: "https://github.com/acme/widgets/pull/1".to_string(),
                ..ChatRecord::default()
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "pr_submitted");
        assert_eq!(json["data"]["session"], "s-1");
        assert_eq!(
            json["data"]["chat"]["pullRequestUrl"],
            "https://github.com/acme/widgets/pull/1"
        );

        let progress = serde_json::to_value(AgentEvent::progress(MSG_GENERATING)).unwrap();
        assert_eq!(progress["event"], "agent_response");
        assert_eq!(progress["data"]["message"], "Generating code changes...");
    }

    #[test]
    fn test_error_without_chat_omits_field() {
        let event = AgentEvent::AgentError {
            pr_url: "boom".to_string(),
            session: None,
            chat: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "agent_error");
        assert!(json["data"]["session"].is_null());
        assert!(json["data"].get("chat").is_none());
    }

    #[test]
    fn test_notification_flattens_event() {
        let n = Notification {
            channel: "sock".to_string(),
            event: AgentEvent::progress("hi"),
        };
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["channel"], "sock");
        assert_eq!(json["event"], "agent_response");
    }

    #[tokio::test]
    async fn test_terminal_events_reach_both_channels() {
        let notifier = RecordingNotifier::default();
        let job = Job::new(fixtures::entry("sock-1"));
        let event = AgentEvent::AgentError {
            pr_url: "x".to_string(),
            session: None,
            chat: None,
        };
        emit_to_job(&notifier, &job, &event).await;
        emit_progress(&notifier, &job, MSG_READING_FILES).await;

        let sent = notifier.sent.lock().unwrap();
        let channels: Vec<&str> = sent.iter().map(|n| n.channel.as_str()).collect();
        assert_eq!(channels, vec!["sock-1", "dev@acme.test", "sock-1"]);
    }

    #[tokio::test]
    async fn test_broadcast_notifier_delivers_to_subscribers() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();
        notifier
            .emit("sock", &AgentEvent::progress(MSG_ANALYZING_TREE))
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.channel, "sock");
        assert_eq!(received.event, AgentEvent::progress(MSG_ANALYZING_TREE));
    }
}
