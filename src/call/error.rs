use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("match filters incomplete: {0} is empty")]
    InvalidFilters(&'static str),

    #[error("call orchestrator has shut down")]
    Shutdown,
}
