//! Minimal DNS packet codec for the tunnel.
//!
//! Only the shapes this protocol needs: TXT queries carrying a synthetic
//! name, and responses answering that name with at most one TXT record.
//! Labels are length-prefixed per RFC 1035; answers point back at the
//! question with a compression pointer. This is deliberately not a general
//! DNS implementation.

use thiserror::Error;

/// DNS header size
const HEADER_LEN: usize = 12;

/// Maximum UDP DNS packet size (RFC 1035)
pub const MAX_UDP_PACKET: usize = 512;

/// TXT record type
const TYPE_TXT: u16 = 0x0010;

/// IN class
const CLASS_IN: u16 = 0x0001;

/// TTL for answer records (seconds)
const ANSWER_TTL: u32 = 60;

/// Longest single TXT character-string
const TXT_STRING_MAX: usize = 255;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("packet too short ({0} bytes)")]
    Truncated(usize),
    #[error("label at offset {offset} claims {claimed} bytes but {remaining} remain")]
    BadLabel {
        offset: usize,
        claimed: usize,
        remaining: usize,
    },
    #[error("query name is not valid UTF-8")]
    BadUtf8,
    #[error("query name `{0}` violates DNS length limits")]
    NameTooLong(String),
}

/// Build a TXT query packet for `qname`.
pub fn build_query(qname: &str, transaction_id: u16) -> Result<Vec<u8>, WireError> {
    let name = qname.trim_end_matches('.');
    if name.len() > crate::chunking::MAX_NAME_LEN {
        return Err(WireError::NameTooLong(name.to_string()));
    }

    let mut packet = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&[0x01, 0x00]); // Flags: standard query, RD
    packet.extend_from_slice(&[0x00, 0x01]); // QDCOUNT: 1
    packet.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
    packet.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    packet.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

    for label in name.split('.') {
        if label.is_empty() || label.len() > crate::chunking::MAX_LABEL_LEN {
            return Err(WireError::NameTooLong(name.to_string()));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&TYPE_TXT.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(packet)
}

/// Parse a query packet into its transaction id and dotted query name.
/// Case is preserved; matching against the protocol grammar happens later.
pub fn parse_query(packet: &[u8]) -> Result<(u16, String), WireError> {
    if packet.len() < HEADER_LEN {
        return Err(WireError::Truncated(packet.len()));
    }
    let transaction_id = u16::from_be_bytes([packet[0], packet[1]]);

    let mut name = String::new();
    let mut pos = HEADER_LEN;
    loop {
        if pos >= packet.len() {
            return Err(WireError::Truncated(packet.len()));
        }
        let len = packet[pos] as usize;
        if len == 0 {
            break;
        }
        pos += 1;
        if pos + len > packet.len() {
            return Err(WireError::BadLabel {
                offset: pos,
                claimed: len,
                remaining: packet.len() - pos,
            });
        }
        let label =
            std::str::from_utf8(&packet[pos..pos + len]).map_err(|_| WireError::BadUtf8)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(label);
        pos += len;
    }

    Ok((transaction_id, name))
}

/// Build a response packet for `query`, echoing its question section and
/// carrying `txt` as a single TXT answer. `None` produces an empty answer
/// set, the reply for unrecognized queries.
pub fn build_response(query: &[u8], transaction_id: u16, txt: Option<&str>) -> Vec<u8> {
    let mut packet = Vec::with_capacity(MAX_UDP_PACKET);
    packet.extend_from_slice(&transaction_id.to_be_bytes());
    packet.extend_from_slice(&[0x81, 0x80]); // Flags: response, RD+RA, NOERROR
    packet.extend_from_slice(&[0x00, 0x01]); // QDCOUNT: 1
    let ancount: u16 = if txt.is_some() { 1 } else { 0 };
    packet.extend_from_slice(&ancount.to_be_bytes());
    packet.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    packet.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

    // Echo the question section from the query (labels + null + QTYPE/QCLASS)
    if query.len() > HEADER_LEN {
        let start = HEADER_LEN;
        let mut end = start;
        while end < query.len() && query[end] != 0 {
            end += 1 + query[end] as usize;
        }
        end += 1 + 4;
        if end <= query.len() {
            packet.extend_from_slice(&query[start..end]);
        }
    }

    if let Some(value) = txt {
        packet.extend_from_slice(&[0xc0, 0x0c]); // NAME: pointer to question
        packet.extend_from_slice(&TYPE_TXT.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
        packet.extend_from_slice(&ANSWER_TTL.to_be_bytes());

        // TXT RDATA is a sequence of length-prefixed character-strings
        let bytes = value.as_bytes();
        let strings = bytes.chunks(TXT_STRING_MAX);
        let rdlength: usize = bytes.len() + strings.len().max(1);
        packet.extend_from_slice(&(rdlength as u16).to_be_bytes());
        if bytes.is_empty() {
            packet.push(0);
        } else {
            for chunk in bytes.chunks(TXT_STRING_MAX) {
                packet.push(chunk.len() as u8);
                packet.extend_from_slice(chunk);
            }
        }
    }

    packet
}

/// Extract the TXT value from a response packet: all character-strings of
/// the first TXT answer, concatenated. `Ok(None)` means the reply carried no
/// answer records (the server's "not recognized" reply).
pub fn parse_txt_response(packet: &[u8]) -> Result<Option<String>, WireError> {
    if packet.len() < HEADER_LEN {
        return Err(WireError::Truncated(packet.len()));
    }
    let ancount = u16::from_be_bytes([packet[6], packet[7]]) as usize;
    if ancount == 0 {
        return Ok(None);
    }

    // Skip question section
    let mut pos = HEADER_LEN;
    while pos < packet.len() && packet[pos] != 0 {
        pos += 1 + packet[pos] as usize;
    }
    pos += 1 + 4;

    for _ in 0..ancount {
        if pos + 2 > packet.len() {
            break;
        }
        // NAME: compression pointer or literal labels
        if packet[pos] & 0xc0 == 0xc0 {
            pos += 2;
        } else {
            while pos < packet.len() && packet[pos] != 0 {
                pos += 1 + packet[pos] as usize;
            }
            pos += 1;
        }
        if pos + 10 > packet.len() {
            break;
        }

        let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        pos += 8; // TYPE + CLASS + TTL
        let rdlength = u16::from_be_bytes([packet[pos], packet[pos + 1]]) as usize;
        pos += 2;
        if pos + rdlength > packet.len() {
            break;
        }

        if rtype == TYPE_TXT {
            let rdata = &packet[pos..pos + rdlength];
            let mut value = String::new();
            let mut i = 0;
            while i < rdata.len() {
                let len = rdata[i] as usize;
                i += 1;
                if i + len > rdata.len() {
                    break;
                }
                value.push_str(
                    std::str::from_utf8(&rdata[i..i + len]).map_err(|_| WireError::BadUtf8)?,
                );
                i += len;
            }
            return Ok(Some(value));
        }
        pos += rdlength;
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_roundtrip() {
        let packet = build_query("m.abc123.0.1.mfzq.llm.local", 0x1234).unwrap();
        assert_eq!(&packet[0..2], &[0x12, 0x34]);

        let (tid, qname) = parse_query(&packet).unwrap();
        assert_eq!(tid, 0x1234);
        assert_eq!(qname, "m.abc123.0.1.mfzq.llm.local");
    }

    #[test]
    fn test_response_with_txt() {
        let query = build_query("g.abc123.0.llm.local", 0xabcd).unwrap();
        let reply = build_response(&query, 0xabcd, Some("0:1:payload"));
        assert_eq!(&reply[0..2], &[0xab, 0xcd]);
        assert_eq!(parse_txt_response(&reply).unwrap().as_deref(), Some("0:1:payload"));
    }

    #[test]
    fn test_empty_answer_response() {
        let query = build_query("www.example.com", 7).unwrap();
        let reply = build_response(&query, 7, None);
        assert_eq!(parse_txt_response(&reply).unwrap(), None);
    }

    #[test]
    fn test_long_txt_splits_into_character_strings() {
        let value: String = std::iter::repeat('x').take(300).collect();
        let query = build_query("g.s.0.llm.local", 1).unwrap();
        let reply = build_response(&query, 1, Some(&value));
        assert_eq!(parse_txt_response(&reply).unwrap().as_deref(), Some(value.as_str()));
    }

    #[test]
    fn test_truncated_packets_rejected() {
        assert!(parse_query(&[0u8; 4]).is_err());
        assert!(parse_txt_response(&[0u8; 4]).is_err());

        // Label claiming more bytes than remain
        let mut packet = build_query("abc.llm.local", 9).unwrap();
        packet[HEADER_LEN] = 60;
        assert!(parse_query(&packet).is_err());
    }

    #[test]
    fn test_oversize_name_rejected() {
        let long_label: String = std::iter::repeat('a').take(70).collect();
        assert!(build_query(&format!("{long_label}.llm.local"), 1).is_err());

        let long_name = format!("{}.llm.local", vec!["abcdefgh"; 40].join("."));
        assert!(build_query(&long_name, 1).is_err());
    }
}
