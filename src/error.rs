use thiserror::Error;

/// Domain failures shared by the aggregator, the resolver and the handlers.
///
/// Each variant maps to a stable wire code through [`AppError::code`].
#[derive(Debug, Error)]
pub enum AppError {
    #[error("sign in first")]
    NotAuthenticated,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("no student or faculty profile is linked to this account")]
    ProfileNotFound,

    #[error("identity {user_id} is linked to both a student and a faculty profile")]
    ProfileConflict { user_id: String },

    #[error("credential store failure: {0}")]
    CredentialStore(String),

    #[error("failed to load profile: {0}")]
    ProfileLoad(#[source] rusqlite::Error),

    #[error("{0}")]
    BadParams(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    UpsertConflict(String),

    #[error("database query failed: {0}")]
    Query(#[source] rusqlite::Error),

    #[error("database update failed: {0}")]
    Update(#[source] rusqlite::Error),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotAuthenticated => "not_authenticated",
            AppError::InvalidCredentials => "invalid_credentials",
            AppError::ProfileNotFound => "profile_not_found",
            AppError::ProfileConflict { .. } => "profile_conflict",
            AppError::CredentialStore(_) => "credential_store_failed",
            AppError::ProfileLoad(_) => "profile_load_failed",
            AppError::BadParams(_) => "bad_params",
            AppError::NotFound(_) => "not_found",
            AppError::Forbidden(_) => "forbidden",
            AppError::Conflict(_) => "conflict",
            AppError::UpsertConflict(_) => "upsert_conflict",
            AppError::Query(_) => "db_query_failed",
            AppError::Update(_) => "db_update_failed",
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        AppError::BadParams(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound(message.into())
    }
}

/// Reads default to `db_query_failed`; writes map explicitly with `AppError::Update`.
impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Query(e)
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// True when a write failed on a UNIQUE or CHECK constraint.
pub fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
