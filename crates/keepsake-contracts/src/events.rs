use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::tasks::{Task, TaskResult, TaskStatus};

/// One notification on the push channel.
///
/// Serialized as `{ "event": "<kind>", "data": { ... } }` with camelCase
/// payload keys. Observers receive every event and filter by `taskId`
/// themselves; the channel has no per-task subscriptions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum TaskEvent {
    #[serde(rename_all = "camelCase")]
    TaskUpdate {
        task_id: String,
        status: TaskStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CardGenerated { task_id: String, card_url: String },
    #[serde(rename_all = "camelCase")]
    VariantsGenerated {
        task_id: String,
        variants: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Log { task_id: String, message: String },
}

impl TaskEvent {
    /// Coarse state event derived from a registry snapshot.
    pub fn update_from(task: &Task) -> Self {
        TaskEvent::TaskUpdate {
            task_id: task.id.clone(),
            status: task.status,
            progress: Some(task.progress),
            error: task.error.clone(),
        }
    }

    /// Artifact-ready event derived from a terminal result.
    pub fn result_ready(task_id: &str, result: &TaskResult) -> Self {
        match result {
            TaskResult::Card { card_url } => TaskEvent::CardGenerated {
                task_id: task_id.to_string(),
                card_url: card_url.clone(),
            },
            TaskResult::Variants { variants } => TaskEvent::VariantsGenerated {
                task_id: task_id.to_string(),
                variants: variants.clone(),
            },
        }
    }
}

/// Broadcast fan-out to every connected observer.
///
/// Publishing never blocks and never fails; with no subscribers the event is
/// simply dropped, and subscribers connected after an event was published
/// never see it. Slow observers may lag and lose events rather than stall
/// the pipeline.
#[derive(Clone, Debug)]
pub struct Notifier {
    sender: broadcast::Sender<TaskEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: TaskEvent) {
        // Err here only means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    /// Free-text narration line, not tied to the formal state machine.
    /// An empty task id marks a global line.
    pub fn log(&self, task_id: &str, message: impl Into<String>) {
        self.publish(TaskEvent::Log {
            task_id: task_id.to_string(),
            message: message.into(),
        });
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn task_update_serializes_with_event_envelope() -> anyhow::Result<()> {
        let event = TaskEvent::TaskUpdate {
            task_id: "abc".to_string(),
            status: TaskStatus::GeneratingLogo,
            progress: Some(30),
            error: None,
        };
        let value: Value = serde_json::from_str(&serde_json::to_string(&event)?)?;
        assert_eq!(value["event"], json!("taskUpdate"));
        assert_eq!(value["data"]["taskId"], json!("abc"));
        assert_eq!(value["data"]["status"], json!("generating logo"));
        assert_eq!(value["data"]["progress"], json!(30));
        assert!(value["data"].get("error").is_none());
        Ok(())
    }

    #[test]
    fn card_event_uses_card_url_key() -> anyhow::Result<()> {
        let event = TaskEvent::CardGenerated {
            task_id: "abc".to_string(),
            card_url: "/generated/abc-card.png".to_string(),
        };
        let value: Value = serde_json::from_str(&serde_json::to_string(&event)?)?;
        assert_eq!(value["event"], json!("cardGenerated"));
        assert_eq!(value["data"]["cardUrl"], json!("/generated/abc-card.png"));
        Ok(())
    }

    #[test]
    fn publish_fans_out_to_all_current_subscribers() {
        let notifier = Notifier::new(8);
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.log("task-1", "hello");

        for receiver in [&mut first, &mut second] {
            match receiver.try_recv() {
                Ok(TaskEvent::Log { task_id, message }) => {
                    assert_eq!(task_id, "task-1");
                    assert_eq!(message, "hello");
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn late_subscribers_see_no_replay() {
        let notifier = Notifier::new(8);
        // Keep one receiver alive so the send is not dropped outright.
        let _early = notifier.subscribe();
        notifier.log("", "before subscribe");

        let mut late = notifier.subscribe();
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let notifier = Notifier::new(8);
        notifier.publish(TaskEvent::Log {
            task_id: String::new(),
            message: "dropped".to_string(),
        });
    }

    #[test]
    fn result_ready_matches_result_shape() {
        let card = TaskEvent::result_ready(
            "t1",
            &TaskResult::Card {
                card_url: "/generated/t1-card.png".to_string(),
            },
        );
        assert!(matches!(card, TaskEvent::CardGenerated { .. }));

        let variants = TaskEvent::result_ready(
            "t2",
            &TaskResult::Variants {
                variants: vec!["u1".to_string()],
            },
        );
        assert!(matches!(variants, TaskEvent::VariantsGenerated { .. }));
    }
}
