//! Structured error type for failures that must surface through the RPC
//! response object (see SPEC_FULL.md §7/§10) rather than as a panic or a
//! silently swallowed `Result`.

use derive_more::{Display, Error};
use serde_json::{Value, json};

/// Errors that take the documented `{status, message}` RPC error shape.
#[derive(Debug, Display, Error)]
pub enum DaemonError {
    #[display("Missing required fields: target and mode")]
    MissingFields,
    #[display("Invalid target: {target}")]
    InvalidTarget { target: String },
    #[display("{name} target is read-only")]
    ReadOnlyTarget { name: String },
    #[display("{name} target is write-only")]
    WriteOnlyTarget { name: String },
    #[display("Missing data for write")]
    MissingWriteData,
    #[display("Invalid mode: {mode}")]
    InvalidMode { mode: String },
    #[display("{message}")]
    Io { message: String },
}

impl DaemonError {
    /// Renders the error as the wire-level `{status, message}` JSON shape
    /// used uniformly across every RPC target's failure path.
    pub fn to_response(&self) -> Value {
        json!({ "status": "error", "message": self.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_message_matches_contract() {
        let err = DaemonError::ReadOnlyTarget { name: "info".into() };
        assert_eq!(
            err.to_response(),
            json!({"status": "error", "message": "info target is read-only"})
        );
    }

    #[test]
    fn missing_fields_message_matches_contract() {
        let err = DaemonError::MissingFields;
        assert_eq!(
            err.to_response()["message"],
            "Missing required fields: target and mode"
        );
    }
}
