//! Message chunking and reassembly for the DNS tunnel.
//!
//! Outbound (client -> server) messages ride in query-name labels:
//! `m.<session>.<index>.<total>.<data>[.<data>...].<suffix>`. Inbound
//! (server -> client) responses are cached as TXT-sized records of the form
//! `{index}:{total}:{payload}`.
//!
//! Data labels use base32 without padding (lowercased on the wire, decoded
//! case-insensitively) behind a fixed-width hex length prefix, so the exact
//! original byte length survives the round trip and doubles as an integrity
//! check. All limits live here as named constants; this is wire protocol
//! version [`PROTOCOL_VERSION`].

use data_encoding::BASE32_NOPAD;
use std::collections::HashMap;
use thiserror::Error;

/// Wire protocol version, reported by the server-info command.
pub const PROTOCOL_VERSION: &str = "4";

/// Maximum bytes per DNS label (RFC 1035)
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum total query name length
pub const MAX_NAME_LEN: usize = 253;

/// Maximum length of a single TXT character-string
pub const MAX_TXT_LEN: usize = 255;

/// Command tag: inbound message fragment
pub const CMD_MESSAGE: &str = "m";

/// Command tag: response chunk fetch
pub const CMD_FETCH: &str = "g";

/// Command tag: server/version info
pub const CMD_INFO: &str = "v";

/// Command tag: best-effort session cleanup
pub const CMD_CLEANUP: &str = "c";

/// Fragment acknowledgement reply
pub const REPLY_OK: &str = "OK";

/// Reply for a chunk index that has not been published
pub const REPLY_NOT_FOUND: &str = "NOT_FOUND";

/// End-of-stream sentinel appended to plaintext before the final encryption
/// pass. Its presence after decryption tells the poller the response is done.
pub const END_MARKER: &str = "<END_OF_RESPONSE>";

/// Hex digits reserved for the byte-length prefix of encoded payloads
const LEN_PREFIX_DIGITS: usize = 8;

/// Digits reserved in the overhead budget for each of index/total
const COUNTER_DIGITS: usize = 4;

/// Largest fragment count the counter reservation can express
const MAX_FRAGMENTS: usize = 9999;

/// TXT budget reserved for the `{index}:{total}:` chunk prefix
const TXT_PREFIX_RESERVE: usize = 2 * COUNTER_DIGITS + 2;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("no payload data fits in a query name with suffix this long")]
    NoCapacity,
    #[error("message needs {0} fragments, more than the {MAX_FRAGMENTS} the counter field allows")]
    TooManyFragments(usize),
    #[error("encoded payload is shorter than its length prefix")]
    BadLengthPrefix,
    #[error("length prefix says {expected} bytes but payload decoded to {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("payload is not valid base32: {0}")]
    Base32(#[from] data_encoding::DecodeError),
    #[error("fragment {0} missing at reassembly")]
    MissingFragment(u32),
}

/// One parsed inbound message fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub session: String,
    pub index: u32,
    pub total: u32,
    /// Encoded data with label boundaries already removed
    pub data: String,
}

/// A recognized tunnel query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Fragment(Fragment),
    Fetch { session: String, index: u32 },
    ServerInfo,
    Cleanup { session: String },
}

/// Stateless encoder/decoder for one suffix configuration.
///
/// Holds no per-session state; reassembly buffers live in the session store.
#[derive(Debug, Clone)]
pub struct Codec {
    suffix_labels: Vec<String>,
    suffix: String,
}

impl Codec {
    /// Build a codec for the given dot-separated domain suffix
    /// (e.g. "llm.local"). Trailing dots are tolerated.
    pub fn new(suffix: &str) -> Result<Self, ChunkError> {
        let labels: Vec<String> = suffix
            .trim_matches('.')
            .split('.')
            .filter(|l| !l.is_empty())
            .map(|l| l.to_ascii_lowercase())
            .collect();
        if labels.is_empty() || labels.iter().any(|l| l.len() > MAX_LABEL_LEN) {
            return Err(ChunkError::NoCapacity);
        }
        let suffix = labels.join(".");
        Ok(Self {
            suffix_labels: labels,
            suffix,
        })
    }

    /// The normalized suffix string.
    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Encoded-data characters available per fragment query, after the fixed
    /// overhead (command tag, session token, both counters, suffix and all
    /// separating dots) is subtracted from the name budget.
    fn fragment_capacity(&self, session: &str) -> Result<usize, ChunkError> {
        let fixed = CMD_MESSAGE.len()
            + 1
            + session.len()
            + 1
            + 2 * (COUNTER_DIGITS + 1)
            + 1 // dot joining the last data label to the suffix
            + self.suffix.len();
        let avail = match MAX_NAME_LEN.checked_sub(fixed) {
            Some(n) if n > 0 => n,
            _ => return Err(ChunkError::NoCapacity),
        };

        // Data longer than one label costs an extra dot per label split;
        // shrink until the assembled form fits.
        let mut cap = avail;
        loop {
            let labels = (cap + MAX_LABEL_LEN - 1) / MAX_LABEL_LEN;
            let need = cap + labels.saturating_sub(1);
            if need <= avail {
                break;
            }
            cap -= need - avail;
            if cap == 0 {
                return Err(ChunkError::NoCapacity);
            }
        }
        Ok(cap)
    }

    /// Split an opaque payload into fragment query names for `session`.
    ///
    /// An empty payload still produces exactly one fragment so the receiver
    /// always observes a completable message.
    pub fn encode_message(&self, payload: &[u8], session: &str) -> Result<Vec<String>, ChunkError> {
        let encoded = encode_payload(payload);
        let cap = self.fragment_capacity(session)?;

        let total = ((encoded.len() + cap - 1) / cap).max(1);
        if total > MAX_FRAGMENTS {
            return Err(ChunkError::TooManyFragments(total));
        }

        let mut queries = Vec::with_capacity(total);
        for index in 0..total {
            let start = index * cap;
            let end = (start + cap).min(encoded.len());
            let mut name = format!("{}.{}.{}.{}", CMD_MESSAGE, session, index, total);
            for label in encoded[start..end].as_bytes().chunks(MAX_LABEL_LEN) {
                name.push('.');
                // chunks of an ASCII string are valid UTF-8
                name.push_str(std::str::from_utf8(label).unwrap_or_default());
            }
            name.push('.');
            name.push_str(&self.suffix);
            debug_assert!(name.len() <= MAX_NAME_LEN);
            queries.push(name);
        }
        Ok(queries)
    }

    /// Build the query name that fetches response chunk `index`.
    pub fn fetch_query(&self, session: &str, index: u32) -> String {
        format!("{}.{}.{}.{}", CMD_FETCH, session, index, self.suffix)
    }

    /// Build the server-info query name.
    pub fn info_query(&self) -> String {
        format!("{}.{}", CMD_INFO, self.suffix)
    }

    /// Build the session-cleanup query name.
    pub fn cleanup_query(&self, session: &str) -> String {
        format!("{}.{}.{}", CMD_CLEANUP, session, self.suffix)
    }

    /// Classify an incoming query name.
    ///
    /// Returns `None` for anything that is not a well-formed tunnel query:
    /// wrong suffix, unknown command tag, bad counters, too few labels.
    /// Foreign DNS traffic lands here routinely, so this never errors.
    pub fn classify(&self, qname: &str) -> Option<Query> {
        let name = qname.trim_end_matches('.');
        let labels: Vec<&str> = name.split('.').collect();

        let n = self.suffix_labels.len();
        if labels.len() <= n {
            return None;
        }
        let (body, tail) = labels.split_at(labels.len() - n);
        let suffix_ok = tail
            .iter()
            .zip(&self.suffix_labels)
            .all(|(a, b)| a.eq_ignore_ascii_case(b));
        if !suffix_ok || body.is_empty() {
            return None;
        }

        match body[0].to_ascii_lowercase().as_str() {
            CMD_MESSAGE => {
                if body.len() < 5 {
                    return None;
                }
                let index: u32 = body[2].parse().ok()?;
                let total: u32 = body[3].parse().ok()?;
                if total == 0 || index >= total {
                    return None;
                }
                Some(Query::Fragment(Fragment {
                    session: body[1].to_string(),
                    index,
                    total,
                    data: body[4..].concat(),
                }))
            }
            CMD_FETCH => {
                if body.len() != 3 {
                    return None;
                }
                Some(Query::Fetch {
                    session: body[1].to_string(),
                    index: body[2].parse().ok()?,
                })
            }
            CMD_INFO | "version" => {
                if body.len() != 1 {
                    return None;
                }
                Some(Query::ServerInfo)
            }
            CMD_CLEANUP => {
                if body.len() != 2 {
                    return None;
                }
                Some(Query::Cleanup {
                    session: body[1].to_string(),
                })
            }
            _ => None,
        }
    }

    /// Payload characters carried per response chunk record.
    pub fn response_capacity(&self) -> usize {
        MAX_TXT_LEN - TXT_PREFIX_RESERVE
    }

    /// Slice an encrypted response token into TXT-sized chunk records keyed
    /// by index. An empty token still yields one (empty-payload) chunk.
    pub fn encode_response_chunks(&self, token: &str) -> HashMap<u32, String> {
        let cap = self.response_capacity();
        let total = ((token.len() + cap - 1) / cap).max(1);

        let mut chunks = HashMap::with_capacity(total);
        for index in 0..total {
            let start = index * cap;
            let end = (start + cap).min(token.len());
            chunks.insert(
                index as u32,
                format!("{}:{}:{}", index, total, &token[start..end]),
            );
        }
        chunks
    }
}

/// Encode raw bytes as a DNS-label-safe string: an 8-hex-digit byte length
/// followed by lowercased unpadded base32.
pub fn encode_payload(data: &[u8]) -> String {
    format!(
        "{:08x}{}",
        data.len(),
        BASE32_NOPAD.encode(data).to_ascii_lowercase()
    )
}

/// Inverse of [`encode_payload`]. The decoded byte count must match the
/// length prefix exactly.
pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, ChunkError> {
    if encoded.len() < LEN_PREFIX_DIGITS {
        return Err(ChunkError::BadLengthPrefix);
    }
    let (prefix, data) = encoded.split_at(LEN_PREFIX_DIGITS);
    let expected =
        usize::from_str_radix(prefix, 16).map_err(|_| ChunkError::BadLengthPrefix)?;
    let bytes = BASE32_NOPAD.decode(data.to_ascii_uppercase().as_bytes())?;
    if bytes.len() != expected {
        return Err(ChunkError::LengthMismatch {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Parse a response chunk record `"{index}:{total}:{payload}"`.
pub fn parse_chunk_record(record: &str) -> Option<(u32, u32, &str)> {
    let mut parts = record.splitn(3, ':');
    let index: u32 = parts.next()?.parse().ok()?;
    let total: u32 = parts.next()?.parse().ok()?;
    let payload = parts.next()?;
    if total == 0 || index >= total {
        return None;
    }
    Some((index, total, payload))
}

/// Reassemble (a possibly partial selection of) response chunk records into
/// the transported token. Missing indices simply shorten the result; the
/// caller finds out when decryption fails that the response is not complete.
pub fn reassemble_response(chunks: &HashMap<u32, String>) -> String {
    let mut indices: Vec<u32> = chunks.keys().copied().collect();
    indices.sort_unstable();

    let mut token = String::new();
    for index in indices {
        if let Some((_, _, payload)) = chunks.get(&index).and_then(|r| parse_chunk_record(r)) {
            token.push_str(payload);
        }
    }
    token
}

/// Index-keyed reassembly buffer for one in-flight inbound message.
///
/// The declared total is fixed by the first-seen fragment; later fragments
/// claiming a different total are judged against the original. Duplicate
/// indices overwrite (last write wins) without advancing completion.
#[derive(Debug)]
pub struct Reassembly {
    total: u32,
    fragments: HashMap<u32, String>,
}

impl Reassembly {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            fragments: HashMap::new(),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Record a fragment. Indices outside the declared range are dropped.
    pub fn insert(&mut self, index: u32, data: String) {
        if index < self.total {
            self.fragments.insert(index, data);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.fragments.len() as u32 == self.total
    }

    /// Concatenate fragments in index order and decode the original bytes.
    pub fn assemble(&self) -> Result<Vec<u8>, ChunkError> {
        let mut encoded = String::new();
        for index in 0..self.total {
            let data = self
                .fragments
                .get(&index)
                .ok_or(ChunkError::MissingFragment(index))?;
            encoded.push_str(data);
        }
        decode_payload(&encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec::new("llm.local").unwrap()
    }

    #[test]
    fn test_payload_encoding_roundtrip() {
        for payload in [&b""[..], b"x", b"Hello, World!", &[0u8; 300]] {
            let encoded = encode_payload(payload);
            assert!(encoded
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
            assert_eq!(decode_payload(&encoded).unwrap(), payload);
        }
    }

    #[test]
    fn test_leading_zero_bytes_survive() {
        let payload = [0u8, 0, 0, 7];
        let decoded = decode_payload(&encode_payload(&payload)).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_length_prefix_mismatch_rejected() {
        let mut encoded = encode_payload(b"hello");
        // Corrupt the length prefix
        encoded.replace_range(0..8, "000000ff");
        assert!(matches!(
            decode_payload(&encoded),
            Err(ChunkError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_small_message_single_fragment() {
        let queries = codec().encode_message(b"small message", "test123").unwrap();
        assert_eq!(queries.len(), 1);

        let labels: Vec<&str> = queries[0].split('.').collect();
        assert_eq!(labels[0], "m");
        assert_eq!(labels[1], "test123");
        assert_eq!(labels[2], "0");
        assert_eq!(labels[3], "1");
        assert!(queries[0].ends_with(".llm.local"));
    }

    #[test]
    fn test_empty_payload_still_one_fragment() {
        let queries = codec().encode_message(b"", "s0").unwrap();
        assert_eq!(queries.len(), 1);
        match codec().classify(&queries[0]) {
            Some(Query::Fragment(frag)) => assert_eq!(frag.total, 1),
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn test_fragment_names_respect_dns_limits() {
        let payload = vec![0xa5u8; 2000];
        let queries = codec().encode_message(&payload, "abc123").unwrap();
        assert!(queries.len() > 1);
        for query in &queries {
            assert!(query.len() <= MAX_NAME_LEN, "name too long: {}", query.len());
            for label in query.split('.') {
                assert!(label.len() <= MAX_LABEL_LEN);
            }
        }
    }

    #[test]
    fn test_reverse_order_reassembly() {
        let codec = codec();
        let payload: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();
        let queries = codec.encode_message(&payload, "rev001").unwrap();
        assert!(queries.len() > 1);

        let mut reassembly: Option<Reassembly> = None;
        let mut result = None;
        for query in queries.iter().rev() {
            let frag = match codec.classify(query) {
                Some(Query::Fragment(frag)) => frag,
                other => panic!("unexpected classification: {:?}", other),
            };
            let buf = reassembly.get_or_insert_with(|| Reassembly::new(frag.total));
            buf.insert(frag.index, frag.data);
            if buf.is_complete() {
                result = Some(buf.assemble().unwrap());
            }
        }
        assert_eq!(result.expect("message never completed"), payload);
    }

    #[test]
    fn test_duplicate_fragment_does_not_complete_early() {
        let codec = codec();
        let payload = vec![0x42u8; 500];
        let queries = codec.encode_message(&payload, "dup001").unwrap();
        assert!(queries.len() >= 2);

        let first = match codec.classify(&queries[0]) {
            Some(Query::Fragment(frag)) => frag,
            _ => unreachable!(),
        };
        let mut buf = Reassembly::new(first.total);
        buf.insert(first.index, first.data.clone());
        buf.insert(first.index, first.data.clone());
        assert!(!buf.is_complete());

        for query in &queries[1..] {
            if let Some(Query::Fragment(frag)) = codec.classify(query) {
                buf.insert(frag.index, frag.data);
            }
        }
        assert!(buf.is_complete());
        assert_eq!(buf.assemble().unwrap(), payload);
    }

    #[test]
    fn test_malformed_queries_rejected() {
        let codec = codec();
        let malformed = [
            "",
            "llm.local",
            "x.sess.0.1.data.llm.local",      // unknown command tag
            "m.sess.zero.1.data.llm.local",   // non-integer index
            "m.sess.0.none.data.llm.local",   // non-integer total
            "m.sess.0.0.data.llm.local",      // zero total
            "m.sess.3.2.data.llm.local",      // index out of range
            "m.sess.0.1.data.example.com",    // wrong suffix
            "m.sess.0.1.llm.local",           // no data label
            "g.sess.llm.local",               // fetch without index
            "g.sess.0.extra.llm.local",       // fetch with too many labels
            "www.google.com",
        ];
        for query in malformed {
            assert_eq!(codec.classify(query), None, "accepted: {query}");
        }
    }

    #[test]
    fn test_classify_is_case_insensitive_and_dot_tolerant() {
        let codec = codec();
        match codec.classify("M.Sess01.0.1.mfzq.LLM.LOCAL.") {
            Some(Query::Fragment(frag)) => {
                assert_eq!(frag.session, "Sess01");
                assert_eq!(frag.index, 0);
                assert_eq!(frag.total, 1);
            }
            other => panic!("unexpected classification: {:?}", other),
        }
        assert_eq!(codec.classify("v.llm.local."), Some(Query::ServerInfo));
        assert_eq!(codec.classify("VERSION.llm.local"), Some(Query::ServerInfo));
    }

    #[test]
    fn test_deep_suffix() {
        let codec = Codec::new("_sonos._tcp.local").unwrap();
        let queries = codec.encode_message(b"hi", "s1").unwrap();
        assert!(queries[0].ends_with("._sonos._tcp.local"));
        assert!(matches!(
            codec.classify(&queries[0]),
            Some(Query::Fragment(_))
        ));
    }

    #[test]
    fn test_response_chunk_roundtrip_13_bytes() {
        let codec = codec();
        let token = "thirteen-byte";
        assert_eq!(token.len(), 13);
        let chunks = codec.encode_response_chunks(token);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[&0], format!("0:1:{token}"));
        assert_eq!(reassemble_response(&chunks), token);
    }

    #[test]
    fn test_response_chunk_large_roundtrip() {
        let codec = codec();
        let token: String = std::iter::repeat("abcdefgh").take(200).collect();
        let chunks = codec.encode_response_chunks(&token);
        assert!(chunks.len() > 1);
        for (index, record) in &chunks {
            let (i, n, _) = parse_chunk_record(record).unwrap();
            assert_eq!(i, *index);
            assert_eq!(n as usize, chunks.len());
        }
        assert_eq!(reassemble_response(&chunks), token);
    }

    #[test]
    fn test_partial_response_is_strict_prefix() {
        let codec = codec();
        let token: String = std::iter::repeat("0123456789").take(100).collect();
        let full = codec.encode_response_chunks(&token);
        assert!(full.len() >= 3);

        let mut partial = full.clone();
        partial.remove(&(full.len() as u32 - 1));
        let reassembled = reassemble_response(&partial);
        assert_ne!(reassembled, token);
        assert!(token.starts_with(&reassembled));
    }

    #[test]
    fn test_session_isolation() {
        let codec = codec();
        let payload_a = vec![0x11u8; 400];
        let payload_b = vec![0x22u8; 700];
        let queries_a = codec.encode_message(&payload_a, "aaaaaa").unwrap();
        let queries_b = codec.encode_message(&payload_b, "bbbbbb").unwrap();

        let mut buffers: HashMap<String, Reassembly> = HashMap::new();
        let mut finished: HashMap<String, Vec<u8>> = HashMap::new();

        // Interleave the two sessions
        let mut interleaved = Vec::new();
        let mut iter_a = queries_a.iter();
        let mut iter_b = queries_b.iter();
        loop {
            match (iter_a.next(), iter_b.next()) {
                (None, None) => break,
                (a, b) => {
                    interleaved.extend(a);
                    interleaved.extend(b);
                }
            }
        }

        for query in interleaved {
            if let Some(Query::Fragment(frag)) = codec.classify(query) {
                let buf = buffers
                    .entry(frag.session.clone())
                    .or_insert_with(|| Reassembly::new(frag.total));
                buf.insert(frag.index, frag.data);
                if buf.is_complete() {
                    finished.insert(frag.session.clone(), buf.assemble().unwrap());
                    buffers.remove(&frag.session);
                }
            }
        }

        assert_eq!(finished["aaaaaa"], payload_a);
        assert_eq!(finished["bbbbbb"], payload_b);
    }
}
