//! Model catalog: bundled presets, imported local files and remote bookmarks
//!
//! - `types.rs`: entries, origins, patches and artifact paths
//! - `defaults.rs`: bundled presets
//! - `store.rs`: the catalog itself and its change channel
//! - `import.rs`: copying local files into app storage

pub mod defaults;
pub mod import;
pub mod store;
pub mod types;

pub use defaults::{bundled_models, is_bundled_id};
pub use import::import_local;
pub use store::{CatalogEvent, ModelCatalog};
pub use types::{download_path, EntryPatch, ModelEntry, ModelOrigin, RemoteFileRef};
