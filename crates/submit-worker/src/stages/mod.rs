//! Concrete collaborators used by the server binary.

pub mod download;
pub mod extract;
pub mod marketplace;
pub mod metadata;
pub mod notifier;
pub mod prepare;

pub use download::HttpDownloader;
pub use extract::ZipExtractor;
pub use marketplace::HttpMarketplace;
pub use metadata::VisionMetadataGenerator;
pub use notifier::{LogNotifier, TelegramNotifier};
pub use prepare::BundlePreparer;
