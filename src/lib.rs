//! dnschat: LLM chat tunneled over DNS
//!
//! dnschat carries an encrypted conversation with an OpenAI-compatible chat
//! backend entirely inside DNS traffic. Outbound messages ride in the labels
//! of TXT query names; responses come back as TXT records, chunked to fit
//! and re-published as growing snapshots while the backend streams.
//!
//! ## Protocol sketch
//!
//! ```text
//! m.<session>.<index>.<total>.<data...>.<suffix>   message fragment -> "OK"
//! g.<session>.<index>.<suffix>                     fetch chunk -> "{i}:{n}:{data}"
//! v.<suffix>                                       server info -> JSON
//! c.<session>.<suffix>                             drop session -> "OK"
//! ```
//!
//! Payloads are ChaCha20-Poly1305 tokens under a shared key; queries for
//! anything outside this grammar get an empty answer.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use dnschat::{ChatClient, ChatConfig, CryptoManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ChatConfig::default();
//!     let crypto = CryptoManager::new(b"shared passphrase");
//!     let client = ChatClient::connect(
//!         "127.0.0.1:5353".parse()?,
//!         &config.dns_suffix,
//!         crypto,
//!         config.poll.clone(),
//!         config.session_token_len,
//!     )
//!     .await?;
//!
//!     let reply = client
//!         .send_message("hello", &mut |delta| print!("{delta}"))
//!         .await?;
//!     println!();
//!     assert!(reply.complete);
//!     Ok(())
//! }
//! ```

pub mod chunking;
pub mod client;
pub mod config;
pub mod crypto;
pub mod llm;
pub mod server;
pub mod session;
pub mod wire;

pub use chunking::{Codec, Fragment, Query, Reassembly};
pub use client::{ChatClient, ChatReply, ClientError, ServerInfo};
pub use config::{ChatConfig, LlmConfig, PollConfig};
pub use crypto::{CryptoError, CryptoManager};
pub use llm::{ChatTurn, LlmClient, LlmError, Role};
pub use server::{ServerError, TunnelServer};
pub use session::SessionStore;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Git revision baked in at build time
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Build timestamp baked in at build time
pub const BUILD_DATE: &str = env!("BUILD_DATE");
