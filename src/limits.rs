//! Shared hard limits to prevent unbounded allocations or payload growth.

use crate::error::{DaqError, DaqResult};

/// Maximum size of one wire frame in bytes, newline excluded (default: 1MB).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
/// Maximum number of live subscriptions one client connection may hold.
pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 4096;
/// Maximum length of a component or attribute name.
pub const MAX_NAME_LEN: usize = 256;

/// Validate the length of an incoming or outgoing frame.
pub fn validate_frame_len(bytes: usize) -> DaqResult<()> {
    if bytes > MAX_FRAME_BYTES {
        return Err(DaqError::RemoteCommunication(format!(
            "frame of {bytes} bytes exceeds limit of {MAX_FRAME_BYTES} bytes"
        )));
    }
    Ok(())
}

/// Validate a component or attribute name received from a peer.
pub fn validate_name(kind: &str, name: &str) -> DaqResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(DaqError::Configuration(format!(
            "{kind} name must be 1..={MAX_NAME_LEN} bytes, got {}",
            name.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_limit() {
        assert!(validate_frame_len(MAX_FRAME_BYTES).is_ok());
        assert!(matches!(
            validate_frame_len(MAX_FRAME_BYTES + 1),
            Err(DaqError::RemoteCommunication(_))
        ));
    }

    #[test]
    fn test_name_limit() {
        assert!(validate_name("component", "stage").is_ok());
        assert!(validate_name("component", "").is_err());
        assert!(validate_name("attribute", &"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
