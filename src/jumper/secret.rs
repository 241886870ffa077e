use thiserror::Error;

/// PSK credentials derived from an `"<identity>:<key>"` shared-secret string.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret {
    pub identity: String,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The key never lands in logs or panic messages.
        f.debug_struct("SharedSecret")
            .field("identity", &self.identity)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid shared secret: expected \"<identity>:<key>\" with both parts non-empty")]
pub struct InvalidSharedSecret;

/// Split a shared-secret string into its identity and key parts.
///
/// The string must contain exactly one `:` with non-empty text on both sides;
/// anything else (no separator, an empty side, an embedded `:` in either
/// part) is rejected rather than truncated. No further validation is applied.
pub fn parse_shared_secret(secret: &str) -> Result<SharedSecret, InvalidSharedSecret> {
    let mut parts = secret.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(identity), Some(key), None) if !identity.is_empty() && !key.is_empty() => {
            Ok(SharedSecret {
                identity: identity.to_string(),
                key: key.as_bytes().to_vec(),
            })
        }
        _ => Err(InvalidSharedSecret),
    }
}

#[cfg(test)]
mod tests {
    use super::{InvalidSharedSecret, parse_shared_secret};

    #[test]
    fn accepts_identity_and_key() {
        let s = parse_shared_secret("identity:key").expect("parse");
        assert_eq!(s.identity, "identity");
        assert_eq!(s.key, b"key");
    }

    #[test]
    fn rejects_malformed_secrets() {
        for bad in ["", "nodelimiter", "identity:", ":key", "a:b:c", ":"] {
            assert_eq!(parse_shared_secret(bad), Err(InvalidSharedSecret), "input {bad:?}");
        }
    }

    #[test]
    fn debug_redacts_key() {
        let s = parse_shared_secret("id:topsecret").expect("parse");
        let dbg = format!("{s:?}");
        assert!(!dbg.contains("topsecret"));
        assert!(dbg.contains("id"));
    }
}
