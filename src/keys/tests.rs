//! Key Encoding Tests
//!
//! Covers the byte layout, decode failures and the identity (equality/hash) of keys.

#[cfg(test)]
mod tests {
    use crate::keys::{Keyspace, MalformedKey, SessionId, StoreKey};
    use std::collections::HashSet;

    const SID: &str = "3f0c5a8e-8d57-4c1e-9a57-0c8f4a3b2d11";

    fn sid() -> SessionId {
        SessionId::parse(SID).unwrap()
    }

    // ============================================================
    // ENCODING TESTS
    // ============================================================

    #[test]
    fn test_session_key_layout() {
        let key = StoreKey::session_data(&sid(), b"cart".to_vec());

        assert_eq!(key.encode(), format!("S:{}:cart", SID).into_bytes());
    }

    #[test]
    fn test_unscoped_key_layout() {
        assert_eq!(StoreKey::node("sessions-created").encode(), b"N:sessions-created");
        assert_eq!(StoreKey::config("offloading").encode(), b"C:offloading");
        assert_eq!(StoreKey::infrastructure("hierarchy").encode(), b"I:hierarchy");
    }

    #[test]
    fn test_absent_sub_key_keeps_trailing_separator() {
        let key = StoreKey::session_metadata(&sid(), Vec::new());

        assert_eq!(key.encode(), format!("M:{}:", SID).into_bytes());
        assert_eq!(key.sub_key(), None);
    }

    #[test]
    fn test_round_trip_over_every_keyspace() {
        let keys = vec![
            StoreKey::session_data(&sid(), Vec::new()),
            StoreKey::session_data(&sid(), vec![0u8, 255, b':', b'*']),
            StoreKey::session_metadata(&sid(), b"req:abc".to_vec()),
            StoreKey::node(Vec::new()),
            StoreKey::node("requests-served"),
            StoreKey::config("offloading"),
            StoreKey::infrastructure("hierarchy"),
        ];

        for key in keys {
            let decoded = StoreKey::decode(&key.encode()).unwrap();
            assert_eq!(decoded, key, "round trip failed for {}", key);
        }
    }

    #[test]
    fn test_patterns() {
        assert_eq!(StoreKey::keyspace_pattern(Keyspace::SessionData), b"S:*");
        assert_eq!(
            StoreKey::session_pattern(Keyspace::SessionMetadata, &sid()),
            format!("M:{}:*", SID).into_bytes()
        );
    }

    // ============================================================
    // DECODING FAILURES
    // ============================================================

    #[test]
    fn test_unknown_tag_is_rejected() {
        let result = StoreKey::decode(b"X:abc");

        assert_eq!(result, Err(MalformedKey::UnknownKeyspace(b'X')));
    }

    #[test]
    fn test_too_short_buffer() {
        assert_eq!(StoreKey::decode(b""), Err(MalformedKey::TooShort(0)));
        assert_eq!(StoreKey::decode(b"N"), Err(MalformedKey::TooShort(1)));
    }

    #[test]
    fn test_missing_separator_after_tag() {
        assert_eq!(
            StoreKey::decode(b"Nsessions"),
            Err(MalformedKey::MissingSeparator(1))
        );
    }

    #[test]
    fn test_truncated_session_segment() {
        let truncated = format!("S:{}", &SID[..20]);
        assert_eq!(
            StoreKey::decode(truncated.as_bytes()),
            Err(MalformedKey::MalformedSession)
        );

        // Full id but no trailing separator
        let no_separator = format!("S:{}", SID);
        assert_eq!(
            StoreKey::decode(no_separator.as_bytes()),
            Err(MalformedKey::MalformedSession)
        );
    }

    #[test]
    fn test_session_segment_must_be_a_uuid() {
        let bogus = format!("M:{}:", "z".repeat(36));

        assert_eq!(
            StoreKey::decode(bogus.as_bytes()),
            Err(MalformedKey::MalformedSession)
        );
    }

    #[test]
    fn test_wrong_separator_after_session() {
        let key = format!("S:{}#cart", SID);

        assert_eq!(
            StoreKey::decode(key.as_bytes()),
            Err(MalformedKey::MissingSeparator(38))
        );
    }

    // ============================================================
    // KEYSPACE EXCLUSIVITY
    // ============================================================

    #[test]
    fn test_constructor_enforces_session_presence() {
        assert_eq!(
            StoreKey::new(Keyspace::SessionData, None, "x"),
            Err(MalformedKey::MissingSession(Keyspace::SessionData))
        );
        assert_eq!(
            StoreKey::new(Keyspace::Node, Some(sid()), "x"),
            Err(MalformedKey::UnexpectedSession(Keyspace::Node))
        );
        assert!(StoreKey::new(Keyspace::Config, None, "x").is_ok());
    }

    #[test]
    fn test_decoded_keys_respect_keyspace_scope() {
        // A node key whose sub-key happens to look like a session id stays unscoped
        let lookalike = format!("N:{}:x", SID);
        let decoded = StoreKey::decode(lookalike.as_bytes()).unwrap();

        assert_eq!(decoded.keyspace(), Keyspace::Node);
        assert!(decoded.session_id().is_none());

        let scoped = StoreKey::decode(format!("M:{}:x", SID).as_bytes()).unwrap();
        assert_eq!(scoped.session_id(), Some(&sid()));
    }

    // ============================================================
    // IDENTITY TESTS
    // ============================================================

    #[test]
    fn test_same_sub_key_under_different_sessions_differs() {
        let a = StoreKey::session_data(&SessionId::new(), "cart");
        let b = StoreKey::session_data(&SessionId::new(), "cart");

        assert_ne!(a, b);

        let set: HashSet<StoreKey> = [a.clone(), b.clone(), a].into_iter().collect();
        assert_eq!(set.len(), 2, "Hash must cover the session id");
    }

    #[test]
    fn test_session_id_validation() {
        assert!(SessionId::parse(SID).is_ok());
        assert!(SessionId::parse("3f0c5a8e8d574c1e9a570c8f4a3b2d11").is_err());
        assert!(SessionId::parse("not-a-session").is_err());
        assert_eq!(SessionId::new().as_str().len(), 36);
    }
}
