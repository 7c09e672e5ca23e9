//! TLS ClientHello SNI extraction.
//!
//! Walks a raw TLS record the same way the bridge's QUIC-inspection helper
//! already does for UDP Initial payloads; TLS's handshake wire format is
//! identical regardless of carrying transport, so the TCP ClientHello case
//! here reuses that record/extension walk verbatim, minus the QUIC framing.

/// Attempts to extract the SNI hostname from a TLS ClientHello record.
/// Returns `None` on anything malformed rather than failing — parsing is
/// best-effort and side-effect-free.
pub fn extract_sni(payload: &[u8]) -> Option<String> {
    if payload.len() < 5 {
        return None;
    }
    // TLS record type must be handshake (0x16).
    if payload[0] != 0x16 {
        return None;
    }
    let record_len = u16::from_be_bytes([payload[3], payload[4]]) as usize;
    if record_len + 5 > payload.len() {
        return None;
    }
    if payload[5] != 0x01 {
        return None; // handshake type != ClientHello
    }
    let mut cursor = 9; // skip handshake header (type + 3-byte length)
    if cursor + 2 > payload.len() {
        return None;
    }
    cursor += 2; // client version
    cursor += 32; // random
    if cursor >= payload.len() {
        return None;
    }
    let session_len = payload[cursor] as usize;
    cursor += 1 + session_len;
    if cursor + 2 > payload.len() {
        return None;
    }
    let cipher_len = u16::from_be_bytes([payload[cursor], payload[cursor + 1]]) as usize;
    cursor += 2 + cipher_len;
    if cursor + 1 > payload.len() {
        return None;
    }
    let compression_len = payload[cursor] as usize;
    cursor += 1 + compression_len;
    if cursor + 2 > payload.len() {
        return None;
    }
    let extensions_len = u16::from_be_bytes([payload[cursor], payload[cursor + 1]]) as usize;
    cursor += 2;
    let extensions_end = cursor + extensions_len.min(payload.len().saturating_sub(cursor));
    while cursor + 4 <= extensions_end {
        let extension_type = u16::from_be_bytes([payload[cursor], payload[cursor + 1]]);
        let extension_len = u16::from_be_bytes([payload[cursor + 2], payload[cursor + 3]]) as usize;
        cursor += 4;
        if cursor + extension_len > extensions_end {
            break;
        }
        if extension_type == 0x0000 {
            return parse_sni_extension(&payload[cursor..cursor + extension_len]);
        }
        cursor += extension_len;
    }
    None
}

fn parse_sni_extension(data: &[u8]) -> Option<String> {
    if data.len() < 2 {
        return None;
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if list_len + 2 > data.len() {
        return None;
    }
    let mut cursor = 2;
    while cursor + 3 <= data.len() {
        let name_type = data[cursor];
        let name_len = u16::from_be_bytes([data[cursor + 1], data[cursor + 2]]) as usize;
        cursor += 3;
        if cursor + name_len > data.len() {
            return None;
        }
        if name_type == 0 {
            return std::str::from_utf8(&data[cursor..cursor + name_len])
                .ok()
                .map(|s| s.to_string());
        }
        cursor += name_len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_hello_with_sni(host: &str) -> Vec<u8> {
        let mut sni_name = Vec::new();
        sni_name.push(0u8); // name type: host_name
        sni_name.extend_from_slice(&(host.len() as u16).to_be_bytes());
        sni_name.extend_from_slice(host.as_bytes());

        let mut server_name_list = Vec::new();
        server_name_list.extend_from_slice(&(sni_name.len() as u16).to_be_bytes());
        server_name_list.extend_from_slice(&sni_name);

        let mut extension = Vec::new();
        extension.extend_from_slice(&0x0000u16.to_be_bytes()); // server_name extension
        extension.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
        extension.extend_from_slice(&server_name_list);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id len
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites len
        body.extend_from_slice(&[0x00, 0x01]);
        body.push(1); // compression methods len
        body.push(0);
        body.extend_from_slice(&(extension.len() as u16).to_be_bytes());
        body.extend_from_slice(&extension);

        let mut handshake = Vec::new();
        handshake.push(0x01); // ClientHello
        let body_len = body.len() as u32;
        handshake.extend_from_slice(&body_len.to_be_bytes()[1..]); // 3-byte length
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(0x16); // handshake record
        record.extend_from_slice(&[0x03, 0x01]); // record version
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_from_client_hello() {
        let record = client_hello_with_sni("example.com");
        assert_eq!(extract_sni(&record), Some("example.com".to_string()));
    }

    #[test]
    fn rejects_non_handshake_records() {
        let mut record = client_hello_with_sni("example.com");
        record[0] = 0x17; // application data
        assert_eq!(extract_sni(&record), None);
    }

    #[test]
    fn rejects_truncated_records() {
        let record = client_hello_with_sni("example.com");
        assert_eq!(extract_sni(&record[..10]), None);
    }
}
