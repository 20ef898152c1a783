/// Extract the value of the first matching header line from a raw preamble.
///
/// Performs a single-pass, case-sensitive scan for the literal
/// `"<name>: "` and returns everything between the value start and the next
/// CRLF. Returns `None` when the header is absent or its CRLF terminator is
/// missing — callers substitute their own default. Header folding, duplicate
/// headers, and headers split across reads are not handled.
pub fn extract_header(buf: &[u8], name: &str) -> Option<String> {
    let mut pattern = Vec::with_capacity(name.len() + 2);
    pattern.extend_from_slice(name.as_bytes());
    pattern.extend_from_slice(b": ");

    let at = find(buf, &pattern)?;
    let rest = &buf[at + pattern.len()..];
    let end = find(rest, b"\r\n")?;

    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

/// Split a `host:port` destination on its last colon.
///
/// The port must parse as a `u16` and the host must be non-empty; anything
/// else is malformed and yields `None`. Splitting on the last colon keeps
/// bracketed IPv6 literals (`[::1]:22`) intact on the host side.
pub fn split_host_port(target: &str) -> Option<(&str, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host, port))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
