//! Error handling for stageflow
//!
//! This module defines the crate-wide error type and a Result alias.
//! Transient flow-control conditions (a full or empty buffer) and
//! cancellation are reported as statuses, never as errors.

use thiserror::Error;

/// Main error type for stageflow operations
#[derive(Error, Debug)]
pub enum StageflowError {
    /// Malformed size, alignment, descriptor or resource declaration.
    /// Always raised before any shared state is mutated.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Requested reservation exceeds the sanity ceiling
    #[error("Requested size {requested} exceeds limit {limit}")]
    TooLarge { requested: usize, limit: usize },

    /// The platform refused to reserve or commit memory
    #[error("Out of memory reserving/committing {requested} bytes: {cause}")]
    OutOfMemory { requested: usize, cause: String },

    /// A bounded resource (reservation ceiling, packet table, block pool) is used up
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// An operator failed while executing a packet
    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    /// The page source collaborator failed
    #[error("Page source error: {0}")]
    Source(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not available on this platform
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Errors related to channel communication
    #[error("Channel error: {0}")]
    Channel(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<StageflowError>,
    },
}

impl StageflowError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        StageflowError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Shorthand for an `InvalidArgument` error
    pub fn invalid(message: impl Into<String>) -> Self {
        StageflowError::InvalidArgument(message.into())
    }

    /// Whether this error (or the error it wraps) is an allocation failure
    /// that was surfaced to the requester without touching shared state.
    pub fn is_resource_exhausted(&self) -> bool {
        match self {
            StageflowError::ResourceExhausted(_) | StageflowError::OutOfMemory { .. } => true,
            StageflowError::WithContext { source, .. } => source.is_resource_exhausted(),
            _ => false,
        }
    }

    /// Whether this error (or the error it wraps) is an `InvalidArgument`
    pub fn is_invalid_argument(&self) -> bool {
        match self {
            StageflowError::InvalidArgument(_) => true,
            StageflowError::WithContext { source, .. } => source.is_invalid_argument(),
            _ => false,
        }
    }
}

/// Result type alias for stageflow operations
pub type Result<T> = std::result::Result<T, StageflowError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
