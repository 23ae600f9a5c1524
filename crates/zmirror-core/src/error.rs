use thiserror::Error;

pub type MirrorResult<T> = Result<T, MirrorError>;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
