//! Workflow notifications
//!
//! The engine emits stage lifecycle events to a sink without waiting for
//! delivery. A failing sink is logged and never reaches the state
//! transition that produced the event.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    OnEnter,
    OnExit,
    OnTimeout,
    OnComplete,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEvent {
    pub kind: NotificationKind,
    pub instance_id: String,
    pub document_id: String,
    pub definition_name: String,
    pub stage: String,
    pub recipients: Vec<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

/// Delivery channel for workflow events (email, push, chat, ...)
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, event: &WorkflowEvent) -> Result<()>;
}

/// Writes events to the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, event: &WorkflowEvent) -> Result<()> {
        tracing::info!(
            "📣 {:?} {} stage '{}' -> {:?}",
            event.kind,
            event.instance_id,
            event.stage,
            event.recipients
        );
        Ok(())
    }
}

/// POSTs each event as JSON to a configured URL
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, event: &WorkflowEvent) -> Result<()> {
        let response = self.client.post(&self.url).json(event).send().await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "notification webhook returned {}",
                response.status()
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationGateway {
    sink: Arc<dyn NotificationSink>,
}

impl Default for NotificationGateway {
    fn default() -> Self {
        Self::new(Arc::new(LogSink))
    }
}

impl NotificationGateway {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Hand events to the sink in the background
    pub fn emit_all(&self, events: Vec<WorkflowEvent>) {
        if events.is_empty() {
            return;
        }
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            for event in events {
                if let Err(e) = sink.send(&event).await {
                    tracing::warn!(
                        "⚠️ Notification {:?} for instance {} not delivered: {}",
                        event.kind,
                        event.instance_id,
                        e
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording(Mutex<Vec<NotificationKind>>);

    #[async_trait]
    impl NotificationSink for Recording {
        async fn send(&self, event: &WorkflowEvent) -> Result<()> {
            self.0.lock().unwrap().push(event.kind);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl NotificationSink for Broken {
        async fn send(&self, _event: &WorkflowEvent) -> Result<()> {
            Err(anyhow::anyhow!("smtp down"))
        }
    }

    fn event(kind: NotificationKind) -> WorkflowEvent {
        WorkflowEvent {
            kind,
            instance_id: "wi-1".into(),
            document_id: "doc-1".into(),
            definition_name: "memo".into(),
            stage: "review".into(),
            recipients: vec!["bob".into()],
            occurred_at: Utc::now(),
            detail: Value::Null,
        }
    }

    #[tokio::test]
    async fn events_are_delivered_in_order() {
        let sink = Arc::new(Recording::default());
        let gateway = NotificationGateway::new(sink.clone());
        gateway.emit_all(vec![event(NotificationKind::OnExit), event(NotificationKind::OnEnter)]);

        for _ in 0..100 {
            if sink.0.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *sink.0.lock().unwrap(),
            vec![NotificationKind::OnExit, NotificationKind::OnEnter]
        );
    }

    #[tokio::test]
    async fn failing_sink_does_not_panic_the_caller() {
        let gateway = NotificationGateway::new(Arc::new(Broken));
        gateway.emit_all(vec![event(NotificationKind::OnTimeout)]);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
