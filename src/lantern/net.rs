use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Config shorthand `":PORT"` means "bind on all interfaces"; Tokio's bind
/// APIs do not accept it, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}
