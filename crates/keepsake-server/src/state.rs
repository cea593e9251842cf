use std::sync::Arc;

use keepsake_contracts::events::Notifier;
use keepsake_contracts::tasks::TaskRegistry;
use keepsake_engine::pipeline::Pipeline;
use keepsake_engine::store::UploadStore;

/// Shared handles threaded through every request handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<TaskRegistry>,
    pub notifier: Notifier,
    pub pipeline: Arc<Pipeline>,
    pub uploads: Arc<UploadStore>,
}
