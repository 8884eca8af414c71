//! Customized unified error type.
//!
//! The phase machine uses the variant of a `ZabError` to decide between
//! restarting the round (back to election) and exiting the participant, so
//! the control-flow-relevant conditions get their own variants; everything
//! else is carried as a message string.

use std::fmt;
use std::io;
use std::net;

/// Customized error type for the Zab engine.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ZabError {
    /// Nothing heard from the peer-of-interest within the configured timeout.
    Timeout,

    /// The election oracle (or a lost leader) told us to restart the round.
    BackToElection,

    /// This server has been administratively removed from the cluster.
    LeftCluster,

    /// The participant task was cancelled by its owner.
    Cancelled,

    /// Joining an existing cluster failed with no stored configuration to
    /// fall back on.
    JoinFailure(String),

    /// A peer violated the protocol (wrong epoch, commit mismatch, ...).
    Protocol(String),

    /// Persistent state is unreadable or inconsistent; fatal to the process.
    Corruption(String),

    /// Any other error, carried as its string representation.
    Msg(String),
}

impl ZabError {
    /// Constructs a `Msg` variant from anything printable.
    pub fn msg(m: impl ToString) -> Self {
        ZabError::Msg(m.to_string())
    }

    /// True if the phase driver should fall back to electing and start a new
    /// round rather than tear the participant down.
    pub fn restarts_round(&self) -> bool {
        matches!(
            self,
            ZabError::Timeout
                | ZabError::BackToElection
                | ZabError::Protocol(_)
                | ZabError::Msg(_)
        )
    }
}

impl fmt::Display for ZabError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ZabError::Timeout => write!(f, "timeout"),
            ZabError::BackToElection => write!(f, "back to election"),
            ZabError::LeftCluster => write!(f, "left cluster"),
            ZabError::Cancelled => write!(f, "cancelled"),
            ZabError::JoinFailure(s) => write!(f, "join failure: {}", s),
            ZabError::Protocol(s) => write!(f, "protocol violation: {}", s),
            ZabError::Corruption(s) => write!(f, "corruption: {}", s),
            ZabError::Msg(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for ZabError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `ZabError::Msg`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ZabError {
            fn from(e: $error) -> Self {
                ZabError::Msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(std::string::FromUtf8Error);
impl_from_error!(tokio::task::JoinError);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ZabError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ZabError::Msg(e.to_string())
    }
}

impl<T> From<tokio::sync::watch::error::SendError<T>> for ZabError {
    fn from(e: tokio::sync::watch::error::SendError<T>) -> Self {
        ZabError::Msg(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = ZabError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
        assert_eq!(format!("{}", ZabError::Timeout), String::from("timeout"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = ZabError::from(io_error);
        assert!(matches!(e, ZabError::Msg(s) if s.contains("oh no!")));
    }

    #[test]
    fn restart_classification() {
        assert!(ZabError::Timeout.restarts_round());
        assert!(ZabError::BackToElection.restarts_round());
        assert!(ZabError::Protocol("bad epoch".into()).restarts_round());
        assert!(!ZabError::LeftCluster.restarts_round());
        assert!(!ZabError::Cancelled.restarts_round());
        assert!(!ZabError::Corruption("bad crc".into()).restarts_round());
    }
}
