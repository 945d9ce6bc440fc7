//! Typed errors for the hard-core device/alarm pipeline.
//!
//! Ambient plumbing (config loading, the database, the web layer) uses
//! `anyhow::Result` instead — these variants exist because calling code
//! needs to match on *kind*, not just display a message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LumiriseError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("illegal transition: {trigger} is not valid from {state}")]
    IllegalTransition { state: String, trigger: String },

    #[error("not connected to broker")]
    NotConnected,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("malformed status payload: {0}")]
    ParseFailure(String),

    #[error("transient broker error: {0}")]
    TransientBrokerError(String),

    #[error("object disposed")]
    ObjectDisposed,
}

pub type Result<T> = std::result::Result<T, LumiriseError>;
