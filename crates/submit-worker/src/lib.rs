//! The publishing worker: stage clients, checkpoint routing, and the claim
//! loop that ties them to the task store.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod routing;
pub mod stages;
mod worker;

pub use collaborators::{
    Collaborators, Downloader, Extractor, Marketplace, MetadataGenerator, Notifier, Preparer,
    StartupSummary,
};
pub use config::{MarketplaceConfig, TelegramConfig, VisionConfig, WorkerConfig};
pub use error::{ErrorKind, StageError, WorkerError};
pub use routing::{Artifacts, Stage, resume_stage};
pub use worker::Worker;
