pub mod config;
pub mod error;

pub use config::MirrorConfig;
pub use error::{MirrorError, MirrorResult};
