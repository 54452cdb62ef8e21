//! Error types for the bridge service boundary
//!
//! Connect and publish failures are recovered into outcomes by the pool;
//! everything in [`BridgeError`] is what a request handler may surface to a
//! user, always through [`BridgeError::user_message`].

use crate::config::ConfigError;
use crate::transport::{ConnectError, PublishError};
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("MQTT configuration incomplete: missing {missing}")]
    ConfigurationIncomplete { missing: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailure { message: String },

    #[error("Failed to decrypt stored credential: {message}")]
    CredentialDecryptFailure { message: String },

    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Collaborator error: {message}")]
    Collaborator { message: String },
}

impl BridgeError {
    /// Create configuration incomplete error
    pub fn configuration_incomplete<S: Into<String>>(missing: S) -> Self {
        Self::ConfigurationIncomplete {
            missing: missing.into(),
        }
    }

    /// Create authentication failure
    pub fn authentication_failure<S: Into<String>>(message: S) -> Self {
        Self::AuthenticationFailure {
            message: message.into(),
        }
    }

    /// Create credential decrypt failure
    pub fn credential_decrypt_failure<S: Into<String>>(message: S) -> Self {
        Self::CredentialDecryptFailure {
            message: message.into(),
        }
    }

    /// Create collaborator error
    pub fn collaborator<S: Into<String>>(message: S) -> Self {
        Self::Collaborator {
            message: message.into(),
        }
    }

    /// Message safe to return to a caller
    pub fn user_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

fn secret_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(password|passwd|token|key|secret)[=:]\s*\S+")
            .unwrap_or_else(|e| panic!("invalid secret pattern: {e}"))
    })
}

/// Redact credentials and bound the length of user-visible messages
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = secret_pattern()
        .replace_all(message, "${1}=***")
        .to_string();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
