//! Configuration error types.

/// Errors raised while locating, loading, or persisting `config.ron`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The platform exposes no per-user configuration directory.
    #[error("no configuration directory available on this platform")]
    NoConfigDir,

    /// Reading `config.ron` failed.
    #[error("failed to read config: {0}")]
    ReadError(#[source] std::io::Error),

    /// Writing `config.ron` (or creating its directory) failed.
    #[error("failed to write config: {0}")]
    WriteError(#[source] std::io::Error),

    /// The file is not valid RON for [`crate::Config`].
    #[error("failed to parse config: {0}")]
    ParseError(#[source] ron::error::SpannedError),

    /// Serializing the in-memory config to RON failed.
    #[error("failed to serialize config: {0}")]
    SerializeError(#[source] ron::Error),
}
