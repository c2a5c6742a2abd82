pub mod config;
pub mod errors;
pub mod events;
pub mod hash;
pub mod index;
pub mod library;
pub mod lifecycle;
pub mod sidecar;
pub mod storage;
pub mod thumbnail;
pub mod trash;

pub use errors::{Result, ShotError};
pub use library::Library;
