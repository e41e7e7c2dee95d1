// Declare the modules to re-export
#[cfg(feature = "connections")]
pub mod connections;
#[cfg(feature = "models")]
pub mod models;
#[cfg(feature = "utils")]
pub mod utils;

// Re-export the common types at the crate root
#[cfg(feature = "connections")]
pub use connections::{SelectedMessage, Store, StoreError};
#[cfg(feature = "models")]
pub use models::message::{
    Message, MessageFilter, MessageId, ReportRecord, MAX_TEXT_LEN, TOMBSTONE_TEXT,
};
