//! End-to-end exchanges over real UDP sockets: client and server on
//! loopback, with either a canned HTTP backend or none at all.

use dnschat::{ChatClient, ChatConfig, CryptoManager, TunnelServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

const KEY: &[u8] = b"roundtrip-test-passphrase";

fn test_config(backend: &str) -> ChatConfig {
    let mut config = ChatConfig::default();
    config.dns_suffix = "llm.local".to_string();
    config.llm.base_url = backend.to_string();
    config.poll.initial_wait_ms = 50;
    config.poll.poll_interval_ms = 50;
    config.poll.response_timeout_ms = 1000;
    config.poll.confirm_wait_ms = 50;
    config.poll.overall_timeout_secs = 10;
    config
}

/// Spawn a tunnel server on an ephemeral loopback port.
async fn spawn_server(config: ChatConfig) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let server = TunnelServer::new(config, CryptoManager::new(KEY)).unwrap();
    tokio::spawn(async move {
        let _ = server.serve_on(socket).await;
    });
    addr
}

async fn connect(config: &ChatConfig, server: SocketAddr) -> ChatClient {
    ChatClient::connect(
        server,
        &config.dns_suffix,
        CryptoManager::new(KEY),
        config.poll.clone(),
        config.session_token_len,
    )
    .await
    .unwrap()
}

/// Minimal OpenAI-shaped backend: answers every chat completion with the
/// same SSE stream and closes the connection.
async fn spawn_sse_backend(deltas: &'static [&'static str]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                // Read headers, then the content-length body
                let body_len = loop {
                    let Ok(n) = stream.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    request.extend_from_slice(&buf[..n]);
                    if let Some(pos) = find_headers_end(&request) {
                        let headers = String::from_utf8_lossy(&request[..pos]);
                        let content_length = headers
                            .lines()
                            .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:")
                                .and_then(|v| v.trim().parse::<usize>().ok()))
                            .unwrap_or(0);
                        break (pos + 4 + content_length).saturating_sub(request.len());
                    }
                };
                let mut remaining = body_len;
                while remaining > 0 {
                    let Ok(n) = stream.read(&mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        break;
                    }
                    remaining = remaining.saturating_sub(n);
                }

                let mut body = String::new();
                for delta in deltas {
                    let escaped = delta.replace('"', "\\\"");
                    body.push_str(&format!(
                        "data: {{\"choices\":[{{\"delta\":{{\"content\":\"{escaped}\"}},\"index\":0}}]}}\n\n"
                    ));
                }
                body.push_str("data: [DONE]\n\n");
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    format!("http://{addr}/v1")
}

fn find_headers_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

#[tokio::test]
async fn streamed_exchange_roundtrip() {
    let backend = spawn_sse_backend(&["Hel", "lo from ", "the tunnel!"]).await;
    let config = test_config(&backend);
    let server = spawn_server(config.clone()).await;
    let client = connect(&config, server).await;

    let deltas = Arc::new(std::sync::Mutex::new(String::new()));
    let sink = Arc::clone(&deltas);
    let mut on_delta = move |d: &str| sink.lock().unwrap().push_str(d);

    let reply = client.send_message("hi", &mut on_delta).await.unwrap();
    assert!(reply.complete);
    assert_eq!(reply.text, "Hello from the tunnel!");
    assert_eq!(*deltas.lock().unwrap(), reply.text);

    client.cleanup().await;
}

#[tokio::test]
async fn simple_mode_waits_for_finished_response() {
    let backend = spawn_sse_backend(&["forty", "-two"]).await;
    let config = test_config(&backend);
    let server = spawn_server(config.clone()).await;
    let client = connect(&config, server).await;

    let text = client.send_message_simple("meaning of life?").await.unwrap();
    assert_eq!(text, "forty-two");
}

#[tokio::test]
async fn long_message_spans_many_fragments() {
    let backend = spawn_sse_backend(&["ack"]).await;
    let config = test_config(&backend);
    let server = spawn_server(config.clone()).await;
    let client = connect(&config, server).await;

    // Large enough that the encrypted token needs several query names
    let message = "tell me everything about ".repeat(40);
    let reply = client.send_message(&message, &mut |_| {}).await.unwrap();
    assert!(reply.complete);
    assert_eq!(reply.text, "ack");
}

#[tokio::test]
async fn dead_backend_reports_error_in_band() {
    let config = test_config("http://127.0.0.1:1/v1");
    let server = spawn_server(config.clone()).await;
    let client = connect(&config, server).await;

    let reply = client.send_message("hello?", &mut |_| {}).await.unwrap();
    assert!(reply.complete);
    assert!(reply.text.starts_with("Error:"), "got: {}", reply.text);
}

#[tokio::test]
async fn server_info_over_udp() {
    let config = test_config("http://127.0.0.1:1/v1");
    let server = spawn_server(config.clone()).await;
    let client = connect(&config, server).await;

    let info = client.server_info().await.unwrap();
    assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    assert_eq!(info.protocol, "4");
}

#[tokio::test]
async fn mismatched_key_times_out_with_partial() {
    let backend = spawn_sse_backend(&["secret"]).await;
    let mut config = test_config(&backend);
    config.poll.overall_timeout_secs = 1;
    config.poll.traditional_attempts = 2;
    let server = spawn_server(config.clone()).await;

    let client = ChatClient::connect(
        server,
        &config.dns_suffix,
        CryptoManager::new(b"not the server key"),
        config.poll.clone(),
        config.session_token_len,
    )
    .await
    .unwrap();

    // The server cannot decrypt the message and publishes an error under its
    // own key, which this client in turn cannot decrypt.
    let reply = client.send_message("psst", &mut |_| {}).await.unwrap();
    assert!(!reply.complete);
    assert!(reply.text.is_empty());
}
