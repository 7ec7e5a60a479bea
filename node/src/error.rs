//! The binary-level error type. Domain logic errors are `mpc_core::MpcError`;
//! everything specific to wiring the concrete collaborators together
//! (config loading, PKCS#11, Git, file I/O) is collected here and converted
//! to `anyhow::Error` at the CLI boundary, keeping the same split as the
//! typed engine errors versus the `anyhow`-wrapped outer binary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    ConfigSource(#[from] config::ConfigError),

    #[error("PKCS#11 error: {0}")]
    Pkcs11(String),

    #[error("git transport error: {0}")]
    Git(#[from] git2::Error),

    #[error("RSA error: {0}")]
    Rsa(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] mpc_core::MpcError),
}

impl From<NodeError> for mpc_core::MpcError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::Core(inner) => inner,
            NodeError::Pkcs11(msg) => mpc_core::MpcError::HsmError(msg),
            NodeError::Git(msg) => mpc_core::MpcError::MailboxError(msg.to_string()),
            other => mpc_core::MpcError::Other(other.to_string()),
        }
    }
}
