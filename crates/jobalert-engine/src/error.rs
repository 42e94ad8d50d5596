use jobalert_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The job source or subscription directory failed or timed out. Ends the run.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    /// Ends the affected user's processing for this run.
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StoreError),
    #[error("push gateway still failing after {attempts} attempts: {reason}")]
    GatewayTransient { attempts: u32, reason: String },
    /// The device token is dead; the device gets deactivated.
    #[error("push gateway rejected device token: {0}")]
    GatewayTerminal(String),
    #[error("push gateway refused the notification with status {status}: {reason}")]
    GatewayRejected { status: u16, reason: String },
}
