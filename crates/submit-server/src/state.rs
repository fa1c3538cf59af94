use std::sync::Arc;

use submit_db::TaskStore;
use submit_worker::Notifier;

#[derive(Clone)]
pub struct AppState {
    pub store: TaskStore,
    pub notifier: Arc<dyn Notifier>,
}
