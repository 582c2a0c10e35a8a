//! Method and notification name constants owned by the host itself.
//!
//! Each constant is the exact string sent over the wire as the `method`
//! field. Methods served by local targets are named by their namespace
//! (`"<namespace>/<name>"`) and are not listed here.

/// Methods the transport answers itself.
pub struct Methods;

impl Methods {
    // ── Handshake ───────────────────────────────────────────────────────
    pub const HANDSHAKE: &str = "rpc/handshake";
}

/// Notifications sent by the transport (server → client, no response).
pub struct Notifications;

impl Notifications {
    // ── Handshake ───────────────────────────────────────────────────────
    pub const HANDSHAKE_REQUIRED: &str = "rpc/handshakeRequired";

    // ── Server lifecycle ────────────────────────────────────────────────
    pub const SERVER_CONNECTED: &str = "server/connected";
    pub const SERVER_SHUTTING_DOWN: &str = "server/shuttingDown";
}

/// Namespace of a method name: the part before the first `/`.
pub fn namespace_of(method: &str) -> &str {
    method.split('/').next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_is_first_segment() {
        assert_eq!(namespace_of("session/info"), "session");
        assert_eq!(namespace_of("echo/deep/path"), "echo");
        assert_eq!(namespace_of("bare"), "bare");
        assert_eq!(namespace_of(""), "");
    }
}
