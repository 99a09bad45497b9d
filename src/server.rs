//! DNS tunnel server: UDP loop, query dispatch, and background exchange
//! processing.
//!
//! The receive loop stays fast: every query gets an immediate reply, and
//! completed messages are handed to a spawned task that talks to the
//! backend. That task copies the conversation history under the store lock
//! before it starts and re-acquires the lock only to publish chunk-map
//! snapshots and the final exchange, never holding the lock across a
//! backend await.

use crate::chunking::{Codec, Query, END_MARKER, PROTOCOL_VERSION, REPLY_NOT_FOUND, REPLY_OK};
use crate::config::ChatConfig;
use crate::crypto::CryptoManager;
use crate::llm::{ChatTurn, LlmClient, LlmError};
use crate::session::SessionStore;
use crate::wire;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;

/// Janitor interval for sweeping idle sessions
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const HELP_TEXT: &str = "Commands: /help shows this text; /clear or /reset forgets conversation \
history; /list shows models offered by the backend; /model <name> switches the model for new \
exchanges.";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("codec setup failed: {0}")]
    Chunk(#[from] crate::chunking::ChunkError),
    #[error("backend client setup failed: {0}")]
    Llm(#[from] LlmError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared pieces a background exchange task needs.
struct Inner {
    codec: Codec,
    crypto: CryptoManager,
    llm: LlmClient,
    store: RwLock<SessionStore>,
    model: RwLock<String>,
    stream: bool,
}

/// The tunnel server. Owns the session store; answers only its own
/// synthetic query namespace and ignores everything else.
pub struct TunnelServer {
    config: ChatConfig,
    inner: Arc<Inner>,
}

impl TunnelServer {
    pub fn new(config: ChatConfig, crypto: CryptoManager) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;
        let codec = Codec::new(&config.dns_suffix)?;
        let llm = LlmClient::new(&config.llm)?;
        let inner = Arc::new(Inner {
            codec,
            crypto,
            llm,
            store: RwLock::new(SessionStore::new(config.max_history_turns)),
            model: RwLock::new(config.llm.model.clone()),
            stream: config.llm.stream,
        });
        Ok(Self { config, inner })
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<(), ServerError> {
        let socket = UdpSocket::bind(self.config.listen_addr).await?;
        self.serve_on(socket).await
    }

    /// Serve on an already-bound socket.
    pub async fn serve_on(&self, socket: UdpSocket) -> Result<(), ServerError> {
        log::info!(
            "dnschat server listening on {} (suffix {})",
            socket.local_addr()?,
            self.inner.codec.suffix()
        );

        // Janitor for sessions abandoned without a cleanup query
        let janitor = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let swept = janitor.store.write().await.sweep_idle();
                if swept > 0 {
                    log::info!("swept {} idle session(s)", swept);
                }
            }
        });

        let mut buf = vec![0u8; wire::MAX_UDP_PACKET];
        loop {
            let (len, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    log::error!("UDP recv error: {}", e);
                    continue;
                }
            };

            let (transaction_id, qname) = match wire::parse_query(&buf[..len]) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::debug!("unparseable packet from {}: {}", peer, e);
                    continue;
                }
            };

            log::debug!("query from {}: {}", peer, qname);
            let txt = dispatch(&self.inner, &qname).await;
            let reply = wire::build_response(&buf[..len], transaction_id, txt.as_deref());
            if let Err(e) = socket.send_to(&reply, peer).await {
                log::error!("failed to reply to {}: {}", peer, e);
            }
        }
    }
}

/// Route one query to its handler and produce the TXT reply value.
/// `None` means "no answer records", the reply for foreign traffic.
async fn dispatch(inner: &Arc<Inner>, qname: &str) -> Option<String> {
    match inner.codec.classify(qname) {
        Some(Query::Fragment(fragment)) => {
            let session = fragment.session.clone();
            let completed = inner.store.write().await.ingest_fragment(fragment);
            if let Some(payload) = completed {
                log::info!("session {}: message complete ({} bytes)", session, payload.len());
                let inner = Arc::clone(inner);
                tokio::spawn(async move {
                    process_exchange(inner, session, payload).await;
                });
            }
            Some(REPLY_OK.to_string())
        }
        Some(Query::Fetch { session, index }) => {
            match inner.store.read().await.chunk(&session, index) {
                Some(chunk) => Some(chunk),
                None => Some(REPLY_NOT_FOUND.to_string()),
            }
        }
        Some(Query::ServerInfo) => {
            let model = inner.model.read().await.clone();
            Some(
                json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "protocol": PROTOCOL_VERSION,
                    "model": model,
                })
                .to_string(),
            )
        }
        Some(Query::Cleanup { session }) => {
            let removed = inner.store.write().await.remove(&session);
            log::debug!("cleanup for session {} (existed: {})", session, removed);
            Some(REPLY_OK.to_string())
        }
        None => {
            log::warn!("unrecognized query: {}", qname);
            None
        }
    }
}

/// Handle one completed inbound message end to end. Every failure path
/// publishes encrypted error text through the normal chunk map, so the
/// client's polling loop never needs a separate error channel.
async fn process_exchange(inner: Arc<Inner>, session: String, payload: Vec<u8>) {
    let token = match String::from_utf8(payload) {
        Ok(token) => token,
        Err(_) => {
            publish(&inner, &session, "Error: message payload is not text", true).await;
            return;
        }
    };
    let plaintext = match inner.crypto.decrypt(&token) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            log::warn!("session {}: decrypt failed: {}", session, e);
            publish(
                &inner,
                &session,
                "Error: could not decrypt message; do client and server share the same key?",
                true,
            )
            .await;
            return;
        }
    };

    let trimmed = plaintext.trim();
    if trimmed.starts_with('/') {
        let reply = run_command(&inner, &session, trimmed).await;
        publish(&inner, &session, &reply, true).await;
        return;
    }

    let model = inner.model.read().await.clone();
    let mut history = inner.store.read().await.history(&session);
    history.push(ChatTurn::user(plaintext.clone()));

    let answer = if inner.stream {
        stream_completion(&inner, &session, &model, &history).await
    } else {
        inner.llm.chat(&model, &history).await
    };

    match answer {
        Ok(text) => {
            publish(&inner, &session, &text, true).await;
            inner
                .store
                .write()
                .await
                .record_exchange(&session, plaintext, text);
        }
        Err(e) => {
            log::error!("session {}: backend failed: {}", session, e);
            publish(&inner, &session, &format!("Error: {e}"), true).await;
        }
    }
}

/// Consume the backend's delta stream, republishing the growing text as a
/// fresh snapshot per increment. Returns the full text on success.
async fn stream_completion(
    inner: &Arc<Inner>,
    session: &str,
    model: &str,
    history: &[ChatTurn],
) -> Result<String, LlmError> {
    let mut rx = inner.llm.chat_stream(model, history).await?;
    let mut accumulated = String::new();
    while let Some(item) = rx.recv().await {
        match item {
            Ok(delta) => {
                accumulated.push_str(&delta);
                publish(inner, session, &accumulated, false).await;
            }
            Err(e) => {
                // Surface what we have plus the failure, then bail
                if accumulated.is_empty() {
                    return Err(e);
                }
                accumulated.push_str(&format!("\n[stream interrupted: {e}]"));
                return Ok(accumulated);
            }
        }
    }
    if accumulated.is_empty() {
        return Err(LlmError::Empty);
    }
    Ok(accumulated)
}

/// Encrypt `text` (with the end-of-stream sentinel if `fin`) and swap it in
/// as the session's current chunk snapshot.
async fn publish(inner: &Arc<Inner>, session: &str, text: &str, fin: bool) {
    let plaintext = if fin {
        format!("{text}{END_MARKER}")
    } else {
        text.to_string()
    };
    let token = match inner.crypto.encrypt(&plaintext) {
        Ok(token) => token,
        Err(e) => {
            log::error!("session {}: encrypt failed: {}", session, e);
            return;
        }
    };
    let chunks = inner.codec.encode_response_chunks(&token);
    log::debug!(
        "session {}: publishing {} chunk(s){}",
        session,
        chunks.len(),
        if fin { " [final]" } else { "" }
    );
    inner.store.write().await.publish_chunks(session, chunks);
}

/// In-band plaintext commands, intercepted before the backend.
async fn run_command(inner: &Arc<Inner>, session: &str, line: &str) -> String {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default().to_ascii_lowercase();
    match command.as_str() {
        "/help" => HELP_TEXT.to_string(),
        "/clear" | "/reset" => {
            inner.store.write().await.clear_history(session);
            "Conversation history cleared.".to_string()
        }
        "/list" => match inner.llm.list_models().await {
            Ok(models) if models.is_empty() => "Backend reports no models.".to_string(),
            Ok(models) => format!("Available models: {}", models.join(", ")),
            Err(e) => format!("Error listing models: {e}"),
        },
        "/model" => match words.next() {
            Some(name) => {
                let name = name.to_string();
                *inner.model.write().await = name.clone();
                log::info!("session {}: model switched to {}", session, name);
                format!("Model set to {name}.")
            }
            None => "Usage: /model <name>".to_string(),
        },
        other => format!("Unknown command {other}. Try /help."),
    }
}

// Exposed for integration tests: drive the resolver without a socket.
#[doc(hidden)]
pub struct ResolverHandle {
    inner: Arc<Inner>,
}

impl TunnelServer {
    /// Socket-free handle for exercising dispatch in tests.
    pub fn resolver(&self) -> ResolverHandle {
        ResolverHandle {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ResolverHandle {
    /// Resolve one query name to its TXT reply value, exactly as the UDP
    /// loop would.
    pub async fn resolve(&self, qname: &str) -> Option<String> {
        dispatch(&self.inner, qname).await
    }

    /// Publish response text for a session (what a finished backend
    /// exchange does), for tests that bypass the backend.
    pub async fn publish_text(&self, session: &str, text: &str, fin: bool) {
        publish(&self.inner, session, text, fin).await;
    }

    /// Decrypt helper mirroring the server's own crypto.
    pub fn decrypt(&self, token: &str) -> Result<String, crate::crypto::CryptoError> {
        self.inner.crypto.decrypt(token)
    }
}
