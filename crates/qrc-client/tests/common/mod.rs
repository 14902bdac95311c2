//! Loopback stand-in for a Q-SYS Core.
//!
//! `FakeCore` accepts one connection, records every request it receives, and
//! answers through a responder closure.  Tests can also push raw bytes or
//! whole messages at any time, and close or reset the socket to simulate a
//! Core going away.  `StalledCore` accepts a connection and never reads it.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use qrc_client::ConnectionConfig;
use qrc_core::{encode_frame, FrameDecoder};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long a test waits for something the Core should do promptly.
pub const WAIT: Duration = Duration::from_secs(2);

pub type Responder = Box<dyn Fn(&Value) -> Option<Value> + Send>;

enum Push {
    Raw(Vec<u8>),
    Close,
    Reset,
}

pub struct FakeCore {
    addr: SocketAddr,
    requests: mpsc::UnboundedReceiver<Value>,
    push: mpsc::UnboundedSender<Push>,
}

impl FakeCore {
    /// A Core that answers with [`standard_reply`].
    pub async fn start() -> Self {
        Self::with_responder(Box::new(standard_reply)).await
    }

    /// A Core that records requests but never answers them.
    pub async fn silent() -> Self {
        Self::with_responder(Box::new(|_| None)).await
    }

    pub async fn with_responder(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let (request_tx, requests) = mpsc::unbounded_channel();
        let (push, mut push_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 4096];

            loop {
                tokio::select! {
                    read = stream.read(&mut buf) => {
                        let n = match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        let frames: Vec<String> = decoder.feed(&buf[..n]).filter_map(Result::ok).collect();
                        for frame in frames {
                            let Ok(request) = serde_json::from_str::<Value>(&frame) else {
                                continue;
                            };
                            let reply = responder(&request);
                            let _ = request_tx.send(request);
                            if let Some(reply) = reply {
                                let bytes = encode_frame(&reply).expect("encode reply");
                                if stream.write_all(&bytes).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    push = push_rx.recv() => match push {
                        Some(Push::Raw(bytes)) => {
                            if stream.write_all(&bytes).await.is_err() {
                                return;
                            }
                        }
                        Some(Push::Reset) => {
                            abort_on_drop(&stream);
                            break;
                        }
                        Some(Push::Close) | None => break,
                    }
                }
            }
        });

        Self {
            addr,
            requests,
            push,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", self.addr.port())
    }

    /// Waits for the next request the Core received.
    pub async fn next_request(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.requests.recv())
            .await
            .expect("request within timeout")
            .expect("fake core still running")
    }

    /// Every request received so far, without waiting.
    pub fn drain_requests(&mut self) -> Vec<Value> {
        let mut drained = Vec::new();
        while let Ok(request) = self.requests.try_recv() {
            drained.push(request);
        }
        drained
    }

    pub fn push_raw(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.push.send(Push::Raw(bytes.into()));
    }

    /// Sends one framed message.
    pub fn push(&self, message: Value) {
        self.push_raw(encode_frame(&message).expect("encode push"));
    }

    pub fn close(&self) {
        let _ = self.push.send(Push::Close);
    }

    /// Drops the socket with `SO_LINGER` 0 so the client sees a reset.
    pub fn reset(&self) {
        let _ = self.push.send(Push::Reset);
    }
}

#[allow(deprecated)]
fn abort_on_drop(stream: &TcpStream) {
    let _ = stream.set_linger(Some(Duration::ZERO));
}

/// A Core that accepts one connection and never reads from it, so the
/// client's socket buffers fill up.
pub struct StalledCore {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl StalledCore {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            if let Ok((_stream, _)) = listener.accept().await {
                std::future::pending::<()>().await;
            }
        });
        Self { addr, task }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", self.addr.port())
    }
}

impl Drop for StalledCore {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Answers the way a Core with user `operator` / pin `1234` would.
pub fn standard_reply(request: &Value) -> Option<Value> {
    let id = request.get("id")?.clone();
    let method = request["method"].as_str().unwrap_or_default();
    let outcome = match method {
        "Logon" if request["params"]["Password"] == "1234" => Ok(json!(true)),
        "Logon" => Err(json!({"code": 10, "message": "Logon required"})),
        "StatusGet" => Ok(json!({"Status": "OK"})),
        "NoOp" => Ok(json!({})),
        "ChangeGroup.Poll" => Ok(json!({"Id": request["params"]["Id"], "Changes": []})),
        m if m.starts_with("ChangeGroup.") => Ok(json!(true)),
        _ => Err(json!({"code": -32601, "message": "Method not found"})),
    };
    Some(match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
    })
}

pub fn response(id: u64, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}
