use openssl::{
    error::ErrorStack,
    ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion},
};

/// Cipher suites for the preshared-key leg. Classic TLS 1.2 PSK suites; they
/// use SHA-1 MACs, which OpenSSL rejects above security level 0.
const PSK_CIPHER_LIST: &str = "PSK-AES128-CBC-SHA:PSK-AES256-CBC-SHA";

/// Client connector for certificate-based TLS.
///
/// With `verify_certificates = false` the peer's chain (and hostname) is not
/// checked at all; the caller is expected to surface that choice in its
/// configuration rather than defaulting into it silently.
pub fn certificate_connector(verify_certificates: bool) -> Result<SslConnector, ErrorStack> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    if !verify_certificates {
        builder.set_verify(SslVerifyMode::NONE);
    }
    Ok(builder.build())
}

/// Client connector for preshared-key TLS.
///
/// The handshake is pinned to TLS 1.2: the classic PSK suites do not exist
/// under TLS 1.3, and a 1.3 handshake would silently negotiate a different
/// suite family. No certificate exchange occurs in this mode. OpenSSL caps
/// the identity at 127 bytes and the key at the library's PSK maximum; an
/// oversized credential fails the handshake instead of being truncated.
pub fn preshared_key_connector(identity: &str, key: &[u8]) -> Result<SslConnector, ErrorStack> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_verify(SslVerifyMode::NONE);
    builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
    builder.set_security_level(0);
    builder.set_cipher_list(PSK_CIPHER_LIST)?;

    let identity = identity.as_bytes().to_vec();
    let key = key.to_vec();
    builder.set_psk_client_callback(move |_ssl, _hint, identity_buf, psk_buf| {
        // The identity buffer wants a NUL-terminated C string.
        if identity.len() + 1 > identity_buf.len() || key.len() > psk_buf.len() {
            return Err(ErrorStack::get());
        }
        identity_buf[..identity.len()].copy_from_slice(&identity);
        identity_buf[identity.len()] = 0;
        psk_buf[..key.len()].copy_from_slice(&key);
        Ok(key.len())
    });

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::{certificate_connector, preshared_key_connector};

    #[test]
    fn certificate_connector_builds_in_both_verify_modes() {
        certificate_connector(true).expect("verifying connector");
        certificate_connector(false).expect("non-verifying connector");
    }

    #[test]
    fn preshared_key_connector_accepts_arbitrary_credentials() {
        preshared_key_connector("identity", b"key").expect("psk connector");
        preshared_key_connector("id with spaces", &[0u8, 1, 2, 255]).expect("binary key");
    }
}
