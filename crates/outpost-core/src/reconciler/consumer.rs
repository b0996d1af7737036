//! The event-consumer loop.
//!
//! Draws task-state-change events from an [`EventSource`] and hands them
//! to the [`Reconciler`](super::Reconciler). Delivery is at-least-once: an
//! event is acknowledged once it has been processed to a settled outcome
//! (applied, benign no-op, or unmatched); processing errors leave the
//! message for redelivery. One malformed event never kills the loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Reconciler;
use crate::platform::types::TaskStateEvent;

/// Delay before polling again after a source error.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// An event plus the handle needed to acknowledge it.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub event: TaskStateEvent,
    /// Source-specific acknowledgement handle.
    pub receipt: Option<String>,
}

/// A source of task-state-change events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Wait for the next batch of events. An empty batch is a normal
    /// long-poll timeout.
    async fn poll(&self) -> Result<Vec<InboundEvent>>;

    /// Acknowledge an event so it is not redelivered.
    async fn ack(&self, event: &InboundEvent) -> Result<()>;
}

// Compile-time assertion: EventSource must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn EventSource) {}
};

/// The EventBridge envelope wrapping an ECS task-state-change detail.
#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "detail-type")]
    detail_type: Option<String>,
    detail: Option<TaskStateEvent>,
}

/// Parse a queue message body into a task-state event.
///
/// Accepts both the EventBridge envelope and a bare detail payload (the
/// latter shows up in tests and manual injection).
pub fn parse_event_body(body: &str) -> Result<Option<TaskStateEvent>> {
    if let Ok(envelope) = serde_json::from_str::<EventEnvelope>(body) {
        if let Some(detail) = envelope.detail {
            if envelope
                .detail_type
                .as_deref()
                .is_none_or(|t| t == "ECS Task State Change")
            {
                return Ok(Some(detail));
            }
            debug!(
                detail_type = envelope.detail_type.as_deref().unwrap_or(""),
                "ignoring non-task-state event"
            );
            return Ok(None);
        }
    }
    let event: TaskStateEvent =
        serde_json::from_str(body).context("message body is not a task-state event")?;
    Ok(Some(event))
}

/// SQS-backed event source.
pub struct SqsEventSource {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsEventSource {
    pub fn new(client: aws_sdk_sqs::Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }
}

#[async_trait]
impl EventSource for SqsEventSource {
    async fn poll(&self) -> Result<Vec<InboundEvent>> {
        let response = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(10)
            .wait_time_seconds(20)
            .send()
            .await
            .context("failed to receive messages")?;

        let mut events = Vec::new();
        for message in response.messages() {
            let Some(body) = message.body() else {
                continue;
            };
            match parse_event_body(body) {
                Ok(Some(event)) => events.push(InboundEvent {
                    event,
                    receipt: message.receipt_handle().map(str::to_owned),
                }),
                Ok(None) => {
                    // Recognized but irrelevant; drop it from the queue.
                    if let Some(receipt) = message.receipt_handle() {
                        let _ = self.delete(receipt).await;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "dropping unparseable event message");
                    if let Some(receipt) = message.receipt_handle() {
                        let _ = self.delete(receipt).await;
                    }
                }
            }
        }
        Ok(events)
    }

    async fn ack(&self, event: &InboundEvent) -> Result<()> {
        if let Some(receipt) = &event.receipt {
            self.delete(receipt).await?;
        }
        Ok(())
    }
}

impl SqsEventSource {
    async fn delete(&self, receipt: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .context("failed to delete message")?;
        Ok(())
    }
}

/// Run the consumer loop until the token is cancelled.
pub async fn run_event_consumer(
    source: Arc<dyn EventSource>,
    reconciler: Arc<Reconciler>,
    cancel: CancellationToken,
) {
    info!("event consumer started");
    loop {
        let batch = tokio::select! {
            batch = source.poll() => batch,
            _ = cancel.cancelled() => break,
        };

        let batch = match batch {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "event poll failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => continue,
                    _ = cancel.cancelled() => break,
                }
            }
        };

        for inbound in batch {
            match reconciler.process_event(&inbound.event).await {
                Ok(outcome) => {
                    debug!(task_arn = %inbound.event.task_arn, ?outcome, "event processed");
                    if let Err(err) = source.ack(&inbound).await {
                        warn!(
                            task_arn = %inbound.event.task_arn,
                            error = %err,
                            "failed to acknowledge event (will be redelivered)"
                        );
                    }
                }
                Err(err) => {
                    // Leave unacked for redelivery; the version guard makes
                    // the retry idempotent.
                    warn!(
                        task_arn = %inbound.event.task_arn,
                        error = %err,
                        "event processing failed, leaving for redelivery"
                    );
                }
            }
        }
    }
    info!("event consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_eventbridge_envelope() {
        let body = serde_json::json!({
            "version": "0",
            "detail-type": "ECS Task State Change",
            "source": "aws.ecs",
            "detail": {
                "taskArn": "arn:aws:ecs:us-east-1:0:task/outpost/abc",
                "lastStatus": "STOPPED",
                "containers": [{ "name": "worker", "exitCode": 0 }]
            }
        })
        .to_string();
        let event = parse_event_body(&body).unwrap().expect("event");
        assert_eq!(event.last_status, "STOPPED");
    }

    #[test]
    fn ignores_other_detail_types() {
        let body = serde_json::json!({
            "detail-type": "ECS Deployment State Change",
            "detail": { "taskArn": "arn:x", "lastStatus": "STOPPED" }
        })
        .to_string();
        assert!(parse_event_body(&body).unwrap().is_none());
    }

    #[test]
    fn parses_bare_detail_payload() {
        let body = serde_json::json!({
            "taskArn": "arn:aws:ecs:us-east-1:0:task/outpost/abc",
            "lastStatus": "RUNNING"
        })
        .to_string();
        let event = parse_event_body(&body).unwrap().expect("event");
        assert_eq!(event.last_status, "RUNNING");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_event_body("not json").is_err());
    }
}
