use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline states as they appear on the wire. `Completed` and `Error` are
/// terminal; every other state may transition directly to `Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "analyzing")]
    Analyzing,
    #[serde(rename = "applying style")]
    ApplyingStyle,
    #[serde(rename = "generating logo")]
    GeneratingLogo,
    #[serde(rename = "creating card")]
    CreatingCard,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "error")]
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Processing => "processing",
            TaskStatus::Analyzing => "analyzing",
            TaskStatus::ApplyingStyle => "applying style",
            TaskStatus::GeneratingLogo => "generating logo",
            TaskStatus::CreatingCard => "creating card",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        }
    }
}

/// Output of a completed task. Exactly one shape per mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskResult {
    Card {
        #[serde(rename = "cardUrl")]
        card_url: String,
    },
    Variants { variants: Vec<String> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub style: String,
    pub status: TaskStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Partial state applied by `TaskRegistry::update`. Provided fields replace
/// the stored ones, last write wins; absent fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
}

impl TaskUpdate {
    pub fn stage(status: TaskStatus, progress: u8) -> Self {
        Self {
            status: Some(status),
            progress: Some(progress),
            ..Self::default()
        }
    }

    pub fn completed(result: TaskResult) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            progress: Some(100),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Error),
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// In-memory task registry; the sole owner of authoritative task records.
///
/// Snapshots handed out by `get`/`update` are copies. No history is kept and
/// nothing survives a restart. Finished records are retained for the whole
/// process lifetime; there is no eviction, so long-running deployments trade
/// memory for indefinitely queryable task state.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, style: &str) -> Task {
        let style = if style.trim().is_empty() {
            "normal".to_string()
        } else {
            style.trim().to_string()
        };
        let task = Task {
            id: Uuid::new_v4().to_string(),
            style,
            status: TaskStatus::Processing,
            progress: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
        };
        if let Ok(mut map) = self.tasks.write() {
            map.insert(task.id.clone(), task.clone());
        }
        task
    }

    pub fn update(&self, id: &str, update: TaskUpdate) -> Option<Task> {
        let mut map = self.tasks.write().ok()?;
        let task = map.get_mut(id)?;
        if let Some(status) = update.status {
            task.status = status;
        }
        if let Some(progress) = update.progress {
            task.progress = progress.min(100);
        }
        if update.result.is_some() {
            task.result = update.result;
        }
        if update.error.is_some() {
            task.error = update.error;
        }
        Some(task.clone())
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        let map = self.tasks.read().ok()?;
        map.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
