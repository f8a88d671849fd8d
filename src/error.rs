use thiserror::Error;

/// Everything that halts initialization. Nothing after init is fatal.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("no tokio runtime available to host the connectivity tasks")]
    NoRuntime,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("credential store unavailable: {0:#}")]
    CredentialStore(anyhow::Error),
    #[error("link driver refused initial configuration: {0:#}")]
    DriverConfig(anyhow::Error),
}
