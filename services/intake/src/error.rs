//! Error taxonomy shared by the intake adapters.

use crate::submission::SubmissionStatus;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while moving a submission through the intake pipeline
#[derive(Error, Debug)]
pub enum IntakeError {
    /// Chat session invalid, expired or not signed in
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A received message carried nothing to process
    #[error("No video content: {0}")]
    NoContent(String),

    /// Upload to object storage failed
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Processing function could not be invoked
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Submission not found: {0}")]
    NotFound(Uuid),

    /// Status change that would move a submission backwards or out of a terminal state
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: SubmissionStatus,
        to: SubmissionStatus,
    },

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Connection to Telegram failed: {0}")]
    Connection(String),
}

impl From<sqlx::Error> for IntakeError {
    fn from(err: sqlx::Error) -> Self {
        IntakeError::Ledger(err.to_string())
    }
}

impl IntakeError {
    /// Short stage label used in logs, metrics and health state
    pub fn stage(&self) -> &'static str {
        match self {
            IntakeError::Authentication(_) | IntakeError::Connection(_) => "ingress",
            IntakeError::NoContent(_) => "ingress",
            IntakeError::Transfer(_) => "transfer",
            IntakeError::Dispatch(_) => "dispatch",
            IntakeError::NotFound(_)
            | IntakeError::InvalidTransition { .. }
            | IntakeError::Ledger(_) => "ledger",
            IntakeError::Notification(_) => "notify",
        }
    }
}

pub type Result<T> = std::result::Result<T, IntakeError>;
