use blogmesh_types::LogAddress;

/// Prefix of the protocol a node advertises for every log it holds.
///
/// The full protocol string is the prefix followed by the log address, e.g.
/// `/blogmesh/heads/blogmesh/3fa2...`.
pub const HEAD_PROTOCOL_PREFIX: &str = "/blogmesh/heads";

pub fn head_protocol(address: &LogAddress) -> String {
    format!("{HEAD_PROTOCOL_PREFIX}{address}")
}

/// Recover the log address from a head protocol string.
///
/// Returns `None` for unrelated protocols and for head protocols whose
/// address part does not parse.
pub fn parse_head_protocol(protocol: &str) -> Option<LogAddress> {
    let rest = protocol.strip_prefix(HEAD_PROTOCOL_PREFIX)?;
    if !rest.starts_with('/') {
        return None;
    }
    LogAddress::parse(rest).ok()
}
