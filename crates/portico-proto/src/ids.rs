//! Opaque identifier generation

use uuid::Uuid;

/// Generate a short correlation id for one in-flight request (8 hex chars).
///
/// Uniqueness within a session is enforced by the pending table, not here;
/// callers retry on the (rare) collision.
pub fn request_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Generate a session id (12 hex chars), unique across the server's lifetime.
pub fn session_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = request_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_session_id_shape() {
        let id = session_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_session_ids_differ() {
        assert_ne!(session_id(), session_id());
    }
}
