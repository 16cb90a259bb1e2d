#[derive(Debug, thiserror::Error)]
pub enum Error {
    //
    // Invalid user input
    //
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
    #[error("Invalid name for repository: {0}")]
    InvalidName(String),
    #[error("Invalid repository reference: {0}")]
    InvalidRepository(String),
    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),

    //
    // Error from the registry
    //
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Registry error: {0}")]
    Registry(String),
    #[error("No manifest for tag: {0}")]
    ManifestNotFound(String),
    #[error("Registry returned no digest for tag: {0}")]
    MissingDigest(String),
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),
    #[error("Unsupported WWW-Authenticate header: {0}")]
    UnsupportedAuthHeader(String),

    //
    // System error
    //
    #[error(transparent)]
    InvalidJson(#[from] serde_json::Error),
    #[error(transparent)]
    UnknownIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
