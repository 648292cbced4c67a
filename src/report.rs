use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::task::{StatusMessage, TaskState};

/// Controller-facing channel.
///
/// This is the boundary to the cluster controller; the transport behind it
/// (and its delivery assurance) belongs to the embedding host, not to the
/// agent. Calls are fire-and-forget and must not block.
pub trait StatusSink: Send + Sync {
    fn status(&self, update: StatusMessage);

    /// Framework-level free-text message, used for non-fatal warnings.
    fn framework_message(&self, text: String);
}

/// Everything the controller observes from one agent.
#[derive(Debug)]
pub enum ControllerEvent {
    Status(StatusMessage),
    Message(String),
}

/// In-process [`StatusSink`] delivering events over a channel; the
/// implementation used by the CLI adapter and the tests.
pub struct ChannelStatusSink {
    tx: mpsc::UnboundedSender<ControllerEvent>,
}

impl ChannelStatusSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelStatusSink {
    fn status(&self, update: StatusMessage) {
        let _ = self.tx.send(ControllerEvent::Status(update));
    }

    fn framework_message(&self, text: String) {
        let _ = self.tx.send(ControllerEvent::Message(text));
    }
}

/// Builds complete status messages and fires them at the controller channel.
/// No retries here; a lost message is the transport's problem.
#[derive(Clone)]
pub struct StatusReporter {
    sink: Arc<dyn StatusSink>,
}

impl StatusReporter {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self { sink }
    }

    pub fn report(&self, task_id: Uuid, state: TaskState, payload: Option<Vec<u8>>) {
        tracing::debug!(task_id = %task_id, state = %state, "status update");
        self.sink.status(StatusMessage {
            task_id,
            state,
            payload,
            at: Utc::now(),
        });
    }

    pub fn framework_message(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::warn!(text = %text, "framework message");
        self.sink.framework_message(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_messages_arrive_in_order() {
        let (sink, mut events) = ChannelStatusSink::new();
        let reporter = StatusReporter::new(Arc::new(sink));
        let task_id = Uuid::new_v4();

        reporter.report(task_id, TaskState::Running, None);
        reporter.report(task_id, TaskState::Finished, Some(vec![1, 2]));

        match events.recv().await.unwrap() {
            ControllerEvent::Status(msg) => {
                assert_eq!(msg.task_id, task_id);
                assert_eq!(msg.state, TaskState::Running);
                assert!(msg.payload.is_none());
            }
            other => panic!("expected status, got {other:?}"),
        }
        match events.recv().await.unwrap() {
            ControllerEvent::Status(msg) => {
                assert_eq!(msg.state, TaskState::Finished);
                assert_eq!(msg.payload.as_deref(), Some(&[1u8, 2u8][..]));
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn framework_messages_pass_through() {
        let (sink, mut events) = ChannelStatusSink::new();
        let reporter = StatusReporter::new(Arc::new(sink));
        reporter.framework_message("cwd not available");
        match events.recv().await.unwrap() {
            ControllerEvent::Message(text) => assert_eq!(text, "cwd not available"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn dropped_receiver_does_not_fault() {
        let (sink, events) = ChannelStatusSink::new();
        drop(events);
        let reporter = StatusReporter::new(Arc::new(sink));
        reporter.report(Uuid::new_v4(), TaskState::Running, None);
    }
}
