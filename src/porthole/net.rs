use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Config shorthand `":PORT"` means "bind on all interfaces", which the
/// std `SocketAddr` parser and Tokio bind APIs do not accept, so it is
/// rewritten to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_bind_addr;

    #[test]
    fn port_only_gets_a_wildcard_host() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :9000 ").as_ref(), "0.0.0.0:9000");
    }

    #[test]
    fn full_addresses_pass_through() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }
}
