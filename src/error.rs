//! Error taxonomy shared by the engine components.
//!
//! None of these are fatal to the host page: the controller logs them and
//! degrades to "feature inactive".

use crate::order::TransformKind;

/// Failures surfaced by the reordering engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// No strategy of the discovery cascade matched anything.
    #[error("no playlist items found")]
    DiscoveryEmpty,

    /// Reset was requested before any snapshot was captured.
    #[error("no original order saved")]
    SnapshotMissing,

    /// The engine is not attached to an eligible view.
    #[error("engine is not active")]
    Inactive,

    /// Another discovery+commit is in flight for the same playlist.
    #[error("a reorder is already in progress for playlist {0}")]
    Busy(String),

    /// `None` is not an invokable transform; use reset instead.
    #[error("transform {0:?} cannot be invoked directly")]
    NotInvokable(TransformKind),

    #[error("unknown transform {0:?}")]
    UnknownTransform(String),

    /// The settings backend could not be read or written.
    #[error(transparent)]
    PersistenceUnavailable(#[from] StoreError),
}

/// Key-value backend failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("could not resolve a data directory for the settings store")]
    NoDataDir,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings payload is not valid: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Selector parse failures, with the byte offset of the offending input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,

    #[error("unexpected character {found:?} at offset {offset}")]
    Unexpected { found: char, offset: usize },

    #[error("unterminated {what} starting at offset {offset}")]
    Unterminated { what: &'static str, offset: usize },

    #[error("unsupported pseudo-class :{0}")]
    UnsupportedPseudo(String),
}

/// Engine configuration file failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config could not be serialized: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config document: {0}")]
    Document(#[from] toml_edit::TomlError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
