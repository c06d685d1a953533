use thiserror::Error;

/// Top-level error type for ALTEC operations.
///
/// Variants map directly onto the error taxonomy the Progress Publisher surfaces to
/// polling clients: a `kind` (the variant name) plus a short message, never a stack
/// trace.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AltecError {
    // --- Hard dependency errors (the store is unavailable; callers must fail-fast) ---
    #[error("Postgres error: {0}")]
    Postgres(String),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    // --- Soft dependency errors (a model adapter misbehaved) ---
    /// `transient` distinguishes a retryable hiccup (network blip, upstream 5xx,
    /// circuit open) from a non-retryable one (4xx — the request itself was bad),
    /// per the executor's Transient/Permanent classification (§4.4/§7).
    #[error("Model adapter error: {message}")]
    ModelAdapter { message: String, transient: bool },

    // --- Task-lifecycle errors, surfaced verbatim on the Task row ---
    #[error("Resource deleted")]
    ResourceDeleted,

    #[error("Cancelled by client")]
    CancelledByClient,

    #[error("Timeout: deadline exceeded")]
    Timeout,

    #[error("Too many reclaims")]
    TooManyReclaims,

    #[error("Not the current lock owner")]
    NotOwner,

    // --- Operational / API errors ---
    #[error("Invalid kind: {0}")]
    InvalidKind(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Internal(String),
}

impl AltecError {
    /// Whether this error is from a hard dependency — the whole service degrades.
    pub fn is_hard_dependency(&self) -> bool {
        matches!(
            self,
            Self::Postgres(_) | Self::Redis(_) | Self::StoreUnavailable(_)
        )
    }

    /// Whether a phase raising this error should be retried by the inner
    /// bounded-retry loop before being promoted to `Permanent` (see executor §4.4).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ModelAdapter { transient, .. } => *transient,
            Self::StoreUnavailable(_) => true,
            _ => false,
        }
    }

    /// The short `kind` string surfaced on a FAILED Task's `error.kind` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres_error",
            Self::Redis(_) => "redis_error",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::ModelAdapter { .. } => "permanent_upstream",
            Self::ResourceDeleted => "resource_deleted",
            Self::CancelledByClient => "cancelled",
            Self::Timeout => "timeout",
            Self::TooManyReclaims => "too_many_reclaims",
            Self::NotOwner => "not_owner",
            Self::InvalidKind(_) => "invalid_kind",
            Self::ResourceNotFound(_) => "resource_not_found",
            Self::TaskNotFound(_) => "not_found",
            Self::Config(_) => "config_error",
            Self::Validation(_) => "validation_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

/// Result type alias for ALTEC operations.
pub type Result<T> = std::result::Result<T, AltecError>;
