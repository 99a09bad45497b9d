//! Tunnel client: fragment transmission and response polling.
//!
//! Sending is the easy half: every fragment query must come back `OK`.
//! Retrieval is a polling loop: each round builds a fresh chunk map by
//! scanning indices from zero, so chunks from different server snapshots
//! never mix. A round's map either decrypts (the snapshot was complete at
//! some instant) or it doesn't, and the end-of-stream sentinel inside the
//! plaintext says whether the backend has finished.

use crate::chunking::{
    parse_chunk_record, reassemble_response, Codec, ChunkError, END_MARKER, REPLY_NOT_FOUND,
    REPLY_OK,
};
use crate::config::PollConfig;
use crate::crypto::{CryptoError, CryptoManager};
use crate::wire::{self, WireError};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;

const TOKEN_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("DNS wire error: {0}")]
    Wire(#[from] WireError),
    #[error("chunking error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no reply from server within {0:?}")]
    Timeout(Duration),
    #[error("no response arrived before the deadline")]
    NoResponse,
    #[error("server info reply is not valid JSON: {0}")]
    BadInfo(#[from] serde_json::Error),
}

/// Outcome of one exchange. `complete` is false when the overall deadline
/// expired with only a partial response decrypted.
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub text: String,
    pub complete: bool,
}

/// Server identity, as reported by the info query.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub protocol: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// One tunnel conversation against a single server.
pub struct ChatClient {
    socket: UdpSocket,
    server: SocketAddr,
    codec: Codec,
    crypto: CryptoManager,
    session: String,
    poll: PollConfig,
}

impl ChatClient {
    /// Bind an ephemeral UDP port and mint a fresh session token.
    pub async fn connect(
        server: SocketAddr,
        suffix: &str,
        crypto: CryptoManager,
        poll: PollConfig,
        token_len: usize,
    ) -> Result<Self, ClientError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let session = generate_session_token(token_len);
        log::debug!("session {} talking to {}", session, server);
        Ok(Self {
            socket,
            server,
            codec: Codec::new(suffix)?,
            crypto,
            session,
            poll,
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Send one TXT query and wait for its reply value. Replies whose
    /// transaction id does not match are discarded and the wait continues.
    async fn query(&self, qname: &str) -> Result<Option<String>, ClientError> {
        let transaction_id = rand::random::<u16>();
        let packet = wire::build_query(qname, transaction_id)?;
        self.socket.send_to(&packet, self.server).await?;

        let timeout = Duration::from_millis(self.poll.response_timeout_ms);
        let mut buf = vec![0u8; wire::MAX_UDP_PACKET];
        let reply = tokio::time::timeout(timeout, async {
            loop {
                let (len, peer) = self.socket.recv_from(&mut buf).await?;
                if peer != self.server || len < 2 {
                    continue;
                }
                if u16::from_be_bytes([buf[0], buf[1]]) != transaction_id {
                    log::debug!("discarding reply with stale transaction id");
                    continue;
                }
                return Ok::<Vec<u8>, std::io::Error>(buf[..len].to_vec());
            }
        })
        .await
        .map_err(|_| ClientError::Timeout(timeout))??;

        Ok(wire::parse_txt_response(&reply)?)
    }

    /// Like [`query`], retrying once more after a timeout.
    async fn query_with_retry(&self, qname: &str) -> Result<Option<String>, ClientError> {
        match self.query(qname).await {
            Err(ClientError::Timeout(_)) => {
                log::debug!("timeout on {}, retrying once", qname);
                self.query(qname).await
            }
            other => other,
        }
    }

    /// Encrypt and transmit a message as fragment queries, each acknowledged
    /// with `OK`.
    async fn transmit(&self, plaintext: &str) -> Result<(), ClientError> {
        let token = self.crypto.encrypt(plaintext)?;
        let queries = self.codec.encode_message(token.as_bytes(), &self.session)?;
        log::debug!(
            "session {}: sending {} fragment(s)",
            self.session,
            queries.len()
        );

        for (index, qname) in queries.iter().enumerate() {
            match self.query_with_retry(qname).await? {
                Some(reply) if reply == REPLY_OK => {}
                other => {
                    // The server acknowledges every well-formed fragment, so
                    // anything else is suspicious but not worth aborting for.
                    log::warn!(
                        "fragment {} acknowledged with {:?} instead of OK",
                        index,
                        other
                    );
                }
            }
        }
        Ok(())
    }

    /// One retrieval round: scan chunk indices from zero into a fresh map.
    ///
    /// Scanning stops at the first contiguous run covering a declared total,
    /// after `not_found_tolerance` consecutive misses, or at the scan
    /// ceiling. Indices still missing from a declared total get targeted
    /// re-fetches with capped exponential backoff.
    async fn poll_round(&self) -> Result<HashMap<u32, String>, ClientError> {
        let mut chunks: HashMap<u32, String> = HashMap::new();
        let mut declared_total: Option<u32> = None;
        let mut misses = 0u32;

        for index in 0..self.poll.max_scan_indices {
            if let Some(total) = declared_total {
                if (0..total).all(|i| chunks.contains_key(&i)) {
                    break;
                }
                if index >= total {
                    break;
                }
            }

            match self.query(&self.codec.fetch_query(&self.session, index)).await {
                Ok(Some(record)) if record == REPLY_NOT_FOUND => {
                    misses += 1;
                    if misses >= self.poll.not_found_tolerance {
                        break;
                    }
                }
                Ok(Some(record)) => {
                    if let Some((i, total, _)) = parse_chunk_record(&record) {
                        if i == index {
                            chunks.insert(i, record);
                            declared_total = Some(total);
                            misses = 0;
                        }
                    }
                }
                Ok(None) => {
                    misses += 1;
                    if misses >= self.poll.not_found_tolerance {
                        break;
                    }
                }
                Err(ClientError::Timeout(_)) => {
                    misses += 1;
                    if misses >= self.poll.not_found_tolerance {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(total) = declared_total {
            self.refetch_missing(&mut chunks, total).await;
        }
        Ok(chunks)
    }

    /// Targeted re-fetch of indices missing from a declared total.
    async fn refetch_missing(&self, chunks: &mut HashMap<u32, String>, total: u32) {
        for attempt in 0..self.poll.refetch_retries {
            let missing: Vec<u32> = (0..total).filter(|i| !chunks.contains_key(i)).collect();
            if missing.is_empty() {
                return;
            }
            let backoff = Duration::from_millis(
                (self.poll.backoff_base_ms << attempt).min(self.poll.backoff_cap_ms),
            );
            log::debug!(
                "session {}: {} chunk(s) missing, backing off {:?}",
                self.session,
                missing.len(),
                backoff
            );
            tokio::time::sleep(backoff).await;

            for index in missing {
                let reply = self
                    .query(&self.codec.fetch_query(&self.session, index))
                    .await;
                if let Ok(Some(record)) = reply {
                    if let Some((i, n, payload)) = parse_chunk_record(&record) {
                        // A short non-final chunk means the record was
                        // truncated in transit; leave it for the next pass.
                        let is_final = i + 1 == n;
                        let full = payload.len() == self.codec.response_capacity();
                        if i == index && (is_final || full) {
                            chunks.insert(i, record);
                        }
                    }
                }
            }
        }
    }

    /// Attempt to turn a round's chunk map into plaintext. `None` while the
    /// snapshot is still partial.
    fn try_decrypt(&self, chunks: &HashMap<u32, String>) -> Option<String> {
        if chunks.is_empty() {
            return None;
        }
        let token = reassemble_response(chunks);
        self.crypto.decrypt(&token).ok()
    }

    /// Send a message and stream the response. `on_delta` fires with each
    /// newly revealed span of text, in order; the returned reply carries the
    /// full text. `complete` is false if the deadline expired first.
    pub async fn send_message(
        &self,
        message: &str,
        on_delta: &mut dyn FnMut(&str),
    ) -> Result<ChatReply, ClientError> {
        self.transmit(message).await?;
        tokio::time::sleep(Duration::from_millis(self.poll.initial_wait_ms)).await;

        let deadline =
            Instant::now() + Duration::from_secs(self.poll.overall_timeout_secs);
        let mut shown = String::new();

        loop {
            let chunks = self.poll_round().await?;
            if let Some(plaintext) = self.try_decrypt(&chunks) {
                let (text, finished) = split_end_marker(&plaintext);
                emit_delta(&mut shown, text, on_delta);
                if finished {
                    // One confirming re-poll: a later snapshot may extend the
                    // text if the final publish raced the one we decrypted.
                    tokio::time::sleep(Duration::from_millis(self.poll.confirm_wait_ms))
                        .await;
                    if let Some(confirmed) = self.try_decrypt(&self.poll_round().await?) {
                        let (text, finished) = split_end_marker(&confirmed);
                        if finished && text.len() > shown.len() {
                            emit_delta(&mut shown, text, on_delta);
                        }
                    }
                    return Ok(ChatReply {
                        text: shown,
                        complete: true,
                    });
                }
            }

            if Instant::now() >= deadline {
                log::warn!(
                    "session {}: response deadline expired with {} chars received",
                    self.session,
                    shown.len()
                );
                return Ok(ChatReply {
                    text: shown,
                    complete: false,
                });
            }
            tokio::time::sleep(Duration::from_millis(self.poll.poll_interval_ms)).await;
        }
    }

    /// Send a message and wait for the finished response without streaming:
    /// a bounded number of poll attempts, each accepting only a snapshot
    /// carrying the end sentinel.
    pub async fn send_message_simple(&self, message: &str) -> Result<String, ClientError> {
        self.transmit(message).await?;
        tokio::time::sleep(Duration::from_millis(self.poll.initial_wait_ms)).await;

        for _ in 0..self.poll.traditional_attempts {
            let chunks = self.poll_round().await?;
            if let Some(plaintext) = self.try_decrypt(&chunks) {
                let (text, finished) = split_end_marker(&plaintext);
                if finished {
                    return Ok(text.to_string());
                }
            }
            tokio::time::sleep(Duration::from_millis(self.poll.poll_interval_ms)).await;
        }
        Err(ClientError::NoResponse)
    }

    /// Query the server's identity (version, protocol, active model).
    pub async fn server_info(&self) -> Result<ServerInfo, ClientError> {
        match self.query_with_retry(&self.codec.info_query()).await? {
            Some(reply) => Ok(serde_json::from_str(&reply)?),
            None => Err(ClientError::NoResponse),
        }
    }

    /// Ask the server to drop this session's state. Best-effort; errors are
    /// logged, not surfaced, since the server sweeps idle sessions anyway.
    pub async fn cleanup(&self) {
        let qname = self.codec.cleanup_query(&self.session);
        if let Err(e) = self.query(&qname).await {
            log::debug!("session {}: cleanup query failed: {}", self.session, e);
        }
    }
}

/// Split the end-of-stream sentinel off a decrypted response.
fn split_end_marker(plaintext: &str) -> (&str, bool) {
    match plaintext.find(END_MARKER) {
        Some(pos) => (&plaintext[..pos], true),
        None => (plaintext, false),
    }
}

/// Reveal the span of `text` beyond what was already shown. Snapshots only
/// ever grow, so the shown text is always a prefix of the next decryption.
fn emit_delta(shown: &mut String, text: &str, on_delta: &mut dyn FnMut(&str)) {
    if text.len() > shown.len() && text.starts_with(shown.as_str()) {
        let delta = &text[shown.len()..];
        on_delta(delta);
        shown.push_str(delta);
    } else if text != shown.as_str() {
        // The snapshot diverged (e.g. an error replaced partial output);
        // show it whole.
        on_delta(text);
        *shown = text.to_string();
    }
}

/// Mint a session token: current time XORed with process randomness,
/// reduced into the base-36 space of the requested width.
pub fn generate_session_token(len: usize) -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let mut value = (millis ^ rand::random::<u64>()) as u128 % 36u128.pow(len as u32);

    let mut token = vec![b'0'; len];
    for slot in token.iter_mut().rev() {
        *slot = TOKEN_ALPHABET[(value % 36) as usize];
        value /= 36;
    }
    // The alphabet is ASCII
    String::from_utf8(token).unwrap_or_default()
}
