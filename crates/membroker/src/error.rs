// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by broker handles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The broker has shut down; no further progress is possible.
    #[error("broker closed")]
    Closed,

    /// The consumer handle was closed by its owner.
    #[error("consumer closed")]
    ConsumerClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = BrokerError::InvalidConfig("events must be at least 32".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: events must be at least 32"
        );
        assert_eq!(BrokerError::Closed.to_string(), "broker closed");
        assert_eq!(BrokerError::ConsumerClosed.to_string(), "consumer closed");
    }

    #[test]
    fn test_error_debug() {
        let debug_str = format!("{:?}", BrokerError::Closed);
        assert!(debug_str.contains("Closed"));
    }
}
