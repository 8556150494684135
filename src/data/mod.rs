//! Sample storage and persistence modules.
#[cfg(feature = "storage_csv")]
pub mod recording;
pub mod storage;
pub mod store;
