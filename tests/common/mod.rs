//! In-memory Electrum servers over `tokio::io::duplex`.

#![allow(dead_code)]

use async_trait::async_trait;
use beesync::electrum::{BoxedStream, ClientStatus, ElectrumClient, Endpoint, SocketFactory};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, Notify};

pub const TEST_MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

#[derive(Clone)]
pub struct FakeServer {
    pub name: String,
    pub height: u64,
    /// Answer anything beyond the handshake and pings
    pub answer_calls: bool,
    pub answer_pings: bool,
    /// Reply to headers.subscribe, completing the handshake
    pub answer_headers: bool,
    pub refuse: bool,
    /// script hash → status returned by scripthash.subscribe
    pub statuses: Arc<Mutex<HashMap<String, String>>>,
    /// script hash → history returned by scripthash.get_history
    pub histories: Arc<Mutex<HashMap<String, Value>>>,
    pub received: Arc<Mutex<Vec<Value>>>,
    push: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    kill: Arc<Notify>,
}

impl FakeServer {
    pub fn new(name: &str, height: u64) -> Self {
        Self {
            name: name.to_string(),
            height,
            answer_calls: true,
            answer_pings: true,
            answer_headers: true,
            refuse: false,
            statuses: Arc::default(),
            histories: Arc::default(),
            received: Arc::default(),
            push: Arc::default(),
            kill: Arc::new(Notify::new()),
        }
    }

    pub fn silent(mut self) -> Self {
        self.answer_calls = false;
        self
    }

    pub fn ignoring_pings(mut self) -> Self {
        self.answer_pings = false;
        self
    }

    /// Answer server.version but never headers.subscribe.
    pub fn stalling_handshake(mut self) -> Self {
        self.answer_headers = false;
        self
    }

    pub fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    pub fn endpoint(&self) -> Endpoint { Endpoint::new(self.name.clone(), 50001) }

    /// Drop the live connection.
    pub fn kill(&self) { self.kill.notify_one(); }

    /// Send a notification over the live connection.
    pub fn notify(&self, method: &str, params: Value) {
        let line = format!("{}\n", json!({ "method": method, "params": params }));
        if let Some(push) = self.push.lock().unwrap().as_ref() {
            push.send(line).unwrap();
        }
    }

    pub fn calls(&self, method: &str) -> Vec<Value> {
        self.received.lock().unwrap().iter().filter(|r| r["method"] == method).cloned().collect()
    }

    fn respond(&self, request: &Value) -> Option<Value> {
        let method = request["method"].as_str().unwrap_or_default();
        let param = request["params"][0].as_str().unwrap_or_default().to_string();
        let result = match method {
            "server.version" => json!(["FakeElectrum 1.0", "1.4"]),
            "blockchain.headers.subscribe" if !self.answer_headers => return None,
            "blockchain.headers.subscribe" => json!({ "height": self.height, "hex": "00" }),
            "server.ping" if !self.answer_pings => return None,
            "server.ping" => Value::Null,
            _ if !self.answer_calls => return None,
            "blockchain.scripthash.subscribe" => self.statuses.lock().unwrap().get(&param).map_or(Value::Null, |s| json!(s)),
            "blockchain.scripthash.get_history" => self.histories.lock().unwrap().get(&param).cloned().unwrap_or_else(|| json!([])),
            "blockchain.transaction.broadcast" => {
                return Some(json!({ "id": request["id"], "error": { "code": 1, "message": "bad-txns-inputs-missingorspent" } }));
            }
            "blockchain.estimatefee" => json!(0.0002),
            _ => json!(format!("{}:{}", self.name, method)),
        };
        Some(json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }))
    }

    async fn serve(self, stream: DuplexStream) {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();
        *self.push.lock().unwrap() = Some(push_tx);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { break };
                    let request: Value = serde_json::from_str(&line).unwrap();
                    self.received.lock().unwrap().push(request.clone());
                    if let Some(response) = self.respond(&request) {
                        let out = format!("{}\n", response);
                        if write.write_all(out.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                }
                Some(note) = push_rx.recv() => {
                    if write.write_all(note.as_bytes()).await.is_err() {
                        break;
                    }
                }
                _ = self.kill.notified() => break,
            }
        }
        *self.push.lock().unwrap() = None;
    }
}

/// Socket factory resolving endpoints by host name to fake servers.
pub struct FakeNetwork {
    servers: HashMap<String, FakeServer>,
}

impl FakeNetwork {
    pub fn new(servers: &[FakeServer]) -> Arc<Self> {
        Arc::new(Self { servers: servers.iter().map(|s| (s.name.clone(), s.clone())).collect() })
    }
}

#[async_trait]
impl SocketFactory for FakeNetwork {
    async fn connect(&self, endpoint: &Endpoint) -> io::Result<BoxedStream> {
        let server = self
            .servers
            .get(&endpoint.host)
            .filter(|s| !s.refuse)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))?;
        let (client, remote) = tokio::io::duplex(64 * 1024);
        tokio::spawn(server.serve(remote));
        Ok(Box::new(client))
    }
}

/// Poll until `check` holds, for at most two seconds.
pub async fn wait_for<F: Fn(&ClientStatus) -> bool>(client: &ElectrumClient, check: F) -> ClientStatus {
    for _ in 0..200 {
        let status = client.status().await.expect("status");
        if check(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached: {:?}", client.status().await);
}

pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
