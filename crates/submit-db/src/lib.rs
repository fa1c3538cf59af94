pub use sea_orm;

use sea_orm::{Database, DatabaseConnection};

pub mod entities;
mod error;
mod store;

pub use error::StoreError;
pub use store::{DEFAULT_MAX_ATTEMPTS, QueueSummary, RetryPolicy, TaskStore, TaskUpdate};

pub async fn connect(database_url: &str) -> Result<DatabaseConnection, sea_orm::DbErr> {
    Database::connect(database_url).await
}
