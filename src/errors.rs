pub use log::{debug, error, info, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Xml(#[from] serde_xml_rs::Error),
    #[error(transparent)]
    TempFile(#[from] async_tempfile::Error),
    #[error(transparent)]
    Utf8(#[from] std::str::Utf8Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),
    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Uniqueness violation: {0}")]
    Conflict(String),
    #[error("Transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("Authentication required: {0}")]
    AuthRequired(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Response too large for memory download: {0} bytes")]
    TooLarge(u64),
    #[error("Checksum mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("Repository metadata has no usable primary_db entry")]
    MetadataMissing,
    #[error("Metadata fetch returned a non-repository response (interstitial page?)")]
    Blocked,
    #[error("Store is busy with another mutating operation")]
    Busy,
    #[error("Operation cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else {
            Error::Transport(err)
        }
    }
}

impl Error {
    /// Whether a fresh attempt of the same request can succeed without
    /// touching the session (HTTP 5xx and plain transport faults).
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(err) => match err.status() {
                Some(status) => matches!(status.as_u16(), 500 | 502 | 503 | 504),
                None => true,
            },
            Error::Timeout(_) => true,
            _ => false,
        }
    }

    /// Whether the failure pattern suggests an expired proxy/auth session
    /// that a rebuilt connection pool could fix.
    pub fn wants_session_renewal(&self) -> bool {
        match self {
            Error::AuthRequired(_) => true,
            Error::Transport(err) => err.is_connect() || err.is_request(),
            _ => false,
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Error::InvalidArgument(_) => 2,
            Error::Cancelled => 130,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
