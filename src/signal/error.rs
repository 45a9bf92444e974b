use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("missing credentials: token and session id are both required")]
    MissingCredentials,
    #[error("signaling client has shut down")]
    Shutdown,
}
