//! Close codes and the canonical reason strings surfaced to peers.
//!
//! The 5xxx reason templates are part of the external contract: clients
//! display them verbatim, so their wording never changes.

/// Server- and client-originated close codes beyond the RFC 6455 range.
pub mod code {
    /// Application authentication callback returned false.
    pub const AUTHORIZATION_ERROR: u16 = 5101;
    /// The server is at its configured client capacity.
    pub const SERVER_FULL: u16 = 5102;
    /// The peer was kicked, by an operator or by the server itself.
    pub const KICKED: u16 = 5103;
    /// The peer was banned.
    pub const BANNED: u16 = 5104;
    /// A server-side exception tore the connection down.
    pub const SERVER_EXCEPTION: u16 = 5105;
    /// The client closed the connection deliberately.
    pub const CLIENT_CLOSED: u16 = 5201;
}

/// `(5101, "Authorization error.")`
#[must_use]
pub fn authorization_error() -> (u16, String) {
    (code::AUTHORIZATION_ERROR, "Authorization error.".to_string())
}

/// `(5102, "Server is Full.")`
#[must_use]
pub fn server_full() -> (u16, String) {
    (code::SERVER_FULL, "Server is Full.".to_string())
}

/// `(5103, "Kicked by {user}. (Reason: {reason})")`
///
/// An absent `user` renders as `anonymous`, an absent `reason` as the empty
/// string.
#[must_use]
pub fn kicked(user: Option<&str>, reason: Option<&str>) -> (u16, String) {
    (
        code::KICKED,
        format!(
            "Kicked by {}. (Reason: {})",
            user.unwrap_or("anonymous"),
            reason.unwrap_or("")
        ),
    )
}

/// `(5104, "You have been banned by the {user} for {length}. (Reason: {reason})")`
///
/// Defaults: `anonymous` for the user, `? Days` for the length, empty reason.
#[must_use]
pub fn banned(user: Option<&str>, length: Option<&str>, reason: Option<&str>) -> (u16, String) {
    (
        code::BANNED,
        format!(
            "You have been banned by the {} for {}. (Reason: {})",
            user.unwrap_or("anonymous"),
            length.unwrap_or("? Days"),
            reason.unwrap_or("")
        ),
    )
}

/// `(5105, "Server exception (Message: {msg}).")`
#[must_use]
pub fn server_exception(msg: &str) -> (u16, String) {
    (
        code::SERVER_EXCEPTION,
        format!("Server exception (Message: {msg})."),
    )
}

/// `(5201, "Connection closed by client (Message: {msg}).")`
#[must_use]
pub fn client_closed(msg: &str) -> (u16, String) {
    (
        code::CLIENT_CLOSED,
        format!("Connection closed by client (Message: {msg})."),
    )
}

/// Builds the payload of an outgoing close frame: the big-endian code
/// followed by `"--"` and the reason text. Code 1005 must never appear on
/// the wire, so it yields an empty payload.
#[must_use]
pub fn close_frame_payload(code: u16, reason: &str) -> Vec<u8> {
    if code == 1005 {
        return Vec::new();
    }
    let mut payload = Vec::with_capacity(4 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(b"--");
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Resolves the human-readable reason for a close code received on the wire.
///
/// When the close frame carried reason bytes those win; otherwise standard
/// codes 1000..=1015 map to their canonical short strings and anything else
/// resolves to an empty reason.
#[must_use]
pub fn ws_code_reason(code: u16, wire_reason: &[u8]) -> String {
    if !wire_reason.is_empty() {
        return String::from_utf8_lossy(wire_reason).into_owned();
    }
    match code {
        1000 => "Normal closure",
        1001 => "Going away",
        1002 => "Protocol error",
        1003 => "Unsupported data",
        1005 => "No status received",
        1006 => "Abnormal closure",
        1007 => "Invalid frame payload data",
        1008 => "Policy violation",
        1009 => "Message too big",
        1010 => "Mandatory extension",
        1011 => "Internal server error",
        1012 => "Service restart",
        1013 => "Try again later",
        1014 => "Bad gateway",
        1015 => "TLS handshake failure",
        _ => "",
    }
    .to_string()
}
