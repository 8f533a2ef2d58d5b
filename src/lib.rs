// Re-export modules needed for testing
pub mod api;
pub mod config;
pub mod digest;
pub mod error;
pub mod handler;
pub mod manifest;
pub mod referrers;
pub mod storage;
pub mod verify;
