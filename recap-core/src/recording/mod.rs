pub mod error;
pub mod models;
pub mod store;

pub use error::{RecordingError, RecordingResult};
pub use models::{ArtifactLocations, Recording, RecordingStatus, RecordingTransition};
pub use store::{SqliteRecordingStore, SqliteRecordingStoreBuilder};
