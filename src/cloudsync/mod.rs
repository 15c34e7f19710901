pub mod client;
pub mod manager;

pub use client::{SyncClient, SyncError, SyncItem};
pub use manager::SyncManager;
