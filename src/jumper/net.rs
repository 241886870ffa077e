use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// The `":PORT"` shorthand means "bind on all interfaces", but neither
/// `SocketAddr` parsing nor the Tokio bind APIs accept it, so it is expanded
/// to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Best-effort extraction of the host part of a `host:port` address, used for
/// TLS server-name indication. Bracketed IPv6 literals lose their brackets;
/// an address without a port comes back unchanged.
pub fn host_of(addr: &str) -> &str {
    let s = addr.trim();
    if let Some(rest) = s.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match s.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !port.contains(':') => host,
        _ => s,
    }
}

#[cfg(test)]
mod tests {
    use super::{host_of, normalize_bind_addr};

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":7000").as_ref(), "0.0.0.0:7000");
        assert_eq!(normalize_bind_addr(" :9 ").as_ref(), "0.0.0.0:9");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn host_of_strips_port_and_brackets() {
        assert_eq!(host_of("10.0.0.1:5432"), "10.0.0.1");
        assert_eq!(host_of("db.example.com:4443"), "db.example.com");
        assert_eq!(host_of("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(host_of("db.example.com"), "db.example.com");
    }
}
