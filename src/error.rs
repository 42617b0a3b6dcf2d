// src/error.rs

//! Error types for the chariot engine

use thiserror::Error;

/// Errors surfaced by the recipe engine
#[derive(Error, Debug)]
pub enum Error {
    /// The configuration could not be parsed
    #[error("Parse error: {0}")]
    ParseError(String),

    /// The configuration parsed but is not usable
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A dependency or source reference did not resolve
    #[error("Unresolved reference `{0}`")]
    ResolutionError(String),

    /// A required `@(...)` token had no value in any variable table
    #[error("Unknown embed `{0}`")]
    UnknownEmbed(String),

    /// An `@(` token was never closed
    #[error("Unterminated embed near `{0}`")]
    UnterminatedEmbed(String),

    /// A command inside the container exited nonzero
    #[error("Command exited with status {0}")]
    CommandFailed(i32),

    /// A recipe stage failed
    #[error("{0}")]
    BuildFailed(String),

    /// Installing a package into an image-set layer failed
    #[error("Layer install failed for package `{0}`")]
    LayerInstallFailed(String),

    /// The cache lockfile is held by another process
    #[error("Failed to acquire cache lock: {0}")]
    CacheLocked(String),

    /// Filesystem-level failure with context
    #[error("I/O error: {0}")]
    IoError(String),

    /// Raw I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
