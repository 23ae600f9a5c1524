//! zmirror-cache: download-once artifact cache
//!
//! - `artifact`: filename grammar → [`ArtifactId`]
//! - `slots`: per-filename single-flight slots
//! - `cache`: presence check, upstream fetch, atomic publish
//! - `client`: the shared upstream HTTP client

pub mod artifact;
pub mod cache;
pub mod client;
pub mod error;
pub mod slots;

pub use artifact::{ArchiveFormat, ArtifactId, ArtifactKind};
pub use cache::{ArtifactCache, CacheOutcome};
pub use client::build_client;
pub use error::{FetchError, FetchErrorKind, FetchResult, InvalidFilename};
