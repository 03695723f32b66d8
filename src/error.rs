use thiserror::Error;

/// A `Result` typedef to use with the [`CacheError`] type
pub type Result<T> = std::result::Result<T, CacheError>;

/// Boxed error type used at the Tower service boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A generic "error" for the gateway cache
#[derive(Error, Debug)]
pub enum CacheError {
    /// The request is missing what the cache needs to key it, such as a
    /// `Host` header on a relative-form request line
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// A `Cache-Control` header could not be parsed
    #[error("unparseable cache-control header: {0}")]
    InvalidCacheControl(String),
    /// A directive argument was absent or not a non-negative whole number
    /// of seconds
    #[error("invalid cache-control directive value for {0:?}")]
    InvalidDirective(String),
    /// The stored response carries no max-age or s-maxage directive; the
    /// freshness calculation treats this as zero
    #[error("response has no explicit max-age")]
    NoMaxAge,
    /// The stored response carries no date information from which to
    /// compute its age
    #[error("unable to calculate age of stored response")]
    UnknownAge,
    /// The storage back-end failed in some way other than a plain miss
    #[error("cache store failure")]
    Store(#[source] BoxError),
    /// There was an error building an HTTP header value
    #[error(transparent)]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    /// There was an error parsing the URL
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),
}

impl CacheError {
    /// Wraps a back-end error as a [`CacheError::Store`]
    pub fn store(err: impl Into<BoxError>) -> Self {
        Self::Store(err.into())
    }
}
