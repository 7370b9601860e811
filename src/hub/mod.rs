//! Remote model catalog search and bookmarking

pub mod bridge;
pub mod client;
pub mod types;

pub use bridge::CatalogBridge;
pub use client::{parse_next_link, HfCatalogClient, RemoteCatalog};
pub use types::{FileDetails, HfModel, ModelFile, SearchPage, SearchQuery};
