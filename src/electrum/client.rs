//! ElectrumClient handle and its driver task.
//!
//! The handle is a cheap clone around a command channel. One driver task owns
//! every connection slot, the in-flight request map and the queue of requests
//! issued before any server was verified.
//!
//! ```text
//! ElectrumClient ──Command──▶ Driver ──line──▶ writer task ──▶ server
//!        ▲                      │  ◀──Inbound── reader task ◀──┘
//!        └──oneshot reply───────┘
//! ```

use super::config::{ElectrumConfig, Endpoint};
use super::events::ElectrumEvents;
use super::transport::{spawn_connection, BoxedStream, ConnectionEvent, ConnectionTasks, Inbound, SocketFactory, TcpSocketFactory};
use super::wire::{encode_request, is_subscription, parse_incoming, Incoming, Topic};
use super::ElectrumError;
use crate::keys::{decode_address, script_hash};
use crate::network::NetworkParams;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

type Reply = oneshot::Sender<Result<Value, ElectrumError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub endpoint: String,
    pub state: ConnectionState,
    pub height: Option<u64>,
    pub verified: bool,
}

/// Snapshot of the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStatus {
    pub running: bool,
    pub height: u64,
    pub connections: Vec<ConnectionStatus>,
    pub in_flight: usize,
    pub queued: usize,
}

impl ClientStatus {
    pub fn verified(&self) -> usize { self.connections.iter().filter(|c| c.verified).count() }
}

/// One entry of `blockchain.scripthash.get_history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub tx_hash: String,
    /// 0 or negative while unconfirmed
    pub height: i64,
    #[serde(default)]
    pub fee: Option<u64>,
}

enum Command {
    Connect,
    Close,
    Request { method: String, params: Value, reply: Reply },
    Status { reply: oneshot::Sender<ClientStatus> },
}

#[derive(Clone)]
pub struct ElectrumClient {
    commands: mpsc::UnboundedSender<Command>,
}

impl ElectrumClient {
    /// Spawn the driver. Must be called inside a tokio runtime.
    pub fn new(config: ElectrumConfig, events: Arc<dyn ElectrumEvents>, factory: Arc<dyn SocketFactory>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(Driver::new(config, events, factory).run(rx));
        Self { commands }
    }

    pub fn tcp(config: ElectrumConfig, events: Arc<dyn ElectrumEvents>) -> Self {
        Self::new(config, events, Arc::new(TcpSocketFactory))
    }

    /// Dial every closed endpoint and keep re-dialing until all are lost.
    pub fn connect(&self) -> Result<(), ElectrumError> {
        self.commands.send(Command::Connect).map_err(|_| ElectrumError::Shutdown)
    }

    /// Drop every connection; pending requests fail with `Shutdown`.
    pub fn close(&self) -> Result<(), ElectrumError> {
        self.commands.send(Command::Close).map_err(|_| ElectrumError::Shutdown)
    }

    pub async fn status(&self) -> Result<ClientStatus, ElectrumError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Status { reply }).map_err(|_| ElectrumError::Shutdown)?;
        rx.await.map_err(|_| ElectrumError::Shutdown)
    }

    /// Raw call. Methods ending in `.subscribe` are fanned out.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ElectrumError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request { method: method.to_string(), params, reply })
            .map_err(|_| ElectrumError::Shutdown)?;
        rx.await.map_err(|_| ElectrumError::Shutdown)?
    }

    pub async fn subscribe(&self, method: &str, params: Value) -> Result<Value, ElectrumError> {
        if !is_subscription(method) {
            return Err(ElectrumError::InvalidRequest(format!("{} is not a subscription", method)));
        }
        self.request(method, params).await
    }

    /// Returns the current status (`None` for an address with no history).
    pub async fn subscribe_to_script_hash(&self, script_hash: &str) -> Result<Option<String>, ElectrumError> {
        let status = self.subscribe("blockchain.scripthash.subscribe", json!([script_hash])).await?;
        decode(status)
    }

    /// Subscribes by the address's script hash; notifications arrive keyed by it.
    pub async fn subscribe_to_address(&self, address: &str, network: &NetworkParams) -> Result<Option<String>, ElectrumError> {
        let script = decode_address(address, network).map_err(|e| ElectrumError::InvalidRequest(e.to_string()))?;
        self.subscribe_to_script_hash(&script_hash(&script)).await
    }

    pub async fn get_script_hash_history(&self, script_hash: &str) -> Result<Vec<HistoryItem>, ElectrumError> {
        decode(self.request("blockchain.scripthash.get_history", json!([script_hash])).await?)
    }

    /// Raw transaction hex.
    pub async fn get_transaction(&self, txid: &str) -> Result<String, ElectrumError> {
        decode(self.request("blockchain.transaction.get", json!([txid])).await?)
    }

    /// Returns the txid.
    pub async fn broadcast_transaction(&self, raw_hex: &str) -> Result<String, ElectrumError> {
        decode(self.request("blockchain.transaction.broadcast", json!([raw_hex])).await?)
    }

    /// 80-byte header as hex.
    pub async fn get_block_header(&self, height: u64) -> Result<String, ElectrumError> {
        decode(self.request("blockchain.block.header", json!([height])).await?)
    }

    /// Fee rate in coin units per kilobyte; -1 when the server has no estimate.
    pub async fn get_estimate_fee(&self, blocks: u32) -> Result<f64, ElectrumError> {
        decode(self.request("blockchain.estimatefee", json!([blocks])).await?)
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ElectrumError> {
    serde_json::from_value(value).map_err(|e| ElectrumError::InvalidResponse(e.to_string()))
}

struct Slot {
    endpoint: Endpoint,
    state: ConnectionState,
    generation: u64,
    tasks: Option<ConnectionTasks>,
    height: Option<u64>,
    version_ok: bool,
    verified: bool,
    ping_pending: bool,
    ready_at: Option<Instant>,
}

impl Slot {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            state: ConnectionState::Closed,
            generation: 0,
            tasks: None,
            height: None,
            version_ok: false,
            verified: false,
            ping_pending: false,
            ready_at: None,
        }
    }

    /// Close the socket and bump the generation so late events are ignored.
    fn reset(&mut self) {
        if let Some(tasks) = self.tasks.take() {
            tasks.abort();
        }
        self.state = ConnectionState::Closed;
        self.generation += 1;
        self.height = None;
        self.version_ok = false;
        self.verified = false;
        self.ping_pending = false;
        self.ready_at = None;
    }

    /// Connecting, or connected but not yet verified.
    fn is_pending(&self) -> bool {
        self.state == ConnectionState::Connecting || (self.state == ConnectionState::Ready && !self.verified)
    }
}

enum PendingKind {
    Caller(Reply),
    Version,
    Headers,
    Ping,
    Redundant,
}

struct Pending {
    slot: usize,
    method: String,
    params: Value,
    line: String,
    kind: PendingKind,
}

struct Queued {
    id: u64,
    method: String,
    params: Value,
    line: String,
    reply: Reply,
}

struct Driver {
    config: ElectrumConfig,
    events: Arc<dyn ElectrumEvents>,
    factory: Arc<dyn SocketFactory>,
    slots: Vec<Slot>,
    pending: HashMap<u64, Pending>,
    queue: VecDeque<Queued>,
    statuses: HashMap<String, Option<String>>,
    next_id: u64,
    cursor: usize,
    max_height: u64,
    running: bool,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
}

impl Driver {
    fn new(config: ElectrumConfig, events: Arc<dyn ElectrumEvents>, factory: Arc<dyn SocketFactory>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let slots = config.endpoints.iter().cloned().map(Slot::new).collect();
        Self {
            config,
            events,
            factory,
            slots,
            pending: HashMap::new(),
            queue: VecDeque::new(),
            statuses: HashMap::new(),
            next_id: 0,
            cursor: 0,
            max_height: 0,
            running: false,
            inbound_tx,
            inbound_rx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut keep_alive = ticker(self.config.keep_alive_interval);
        let mut sweep = ticker(self.config.sweep_interval);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(inbound) = self.inbound_rx.recv() => self.handle_inbound(inbound),
                _ = tick(&mut keep_alive) => self.keep_alive(),
                _ = tick(&mut sweep) => self.sweep(),
            }
        }

        tracing::debug!("Electrum client dropped, closing {} connections", self.slots.len());
        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.running = true;
                for index in 0..self.slots.len() {
                    if self.slots[index].state == ConnectionState::Closed {
                        self.dial(index);
                    }
                }
            }
            Command::Close => self.shutdown(),
            Command::Request { method, params, reply } => {
                let id = self.next_id();
                let line = encode_request(id, &method, &params);
                self.route(Queued { id, method, params, line, reply });
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn status(&self) -> ClientStatus {
        ClientStatus {
            running: self.running,
            height: self.max_height,
            connections: self
                .slots
                .iter()
                .map(|s| ConnectionStatus { endpoint: s.endpoint.to_string(), state: s.state, height: s.height, verified: s.verified })
                .collect(),
            in_flight: self.pending.values().filter(|p| matches!(p.kind, PendingKind::Caller(_))).count(),
            queued: self.queue.len(),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn verified_slots(&self) -> Vec<usize> {
        (0..self.slots.len()).filter(|&i| self.slots[i].verified).collect()
    }

    fn any_pending_connection(&self) -> bool { self.slots.iter().any(Slot::is_pending) }

    /// Bind a caller request to a verified connection (round-robin), queue it
    /// while servers are still handshaking, or fail it when none are left.
    fn route(&mut self, request: Queued) {
        let verified = self.verified_slots();
        if verified.is_empty() {
            if self.any_pending_connection() {
                self.queue.push_back(request);
            } else {
                let _ = request.reply.send(Err(ElectrumError::NoLiveConnections));
            }
            return;
        }

        let position = self.cursor % verified.len();
        self.cursor = self.cursor.wrapping_add(1);
        let target = verified[position];

        let Queued { id, method, params, line, reply } = request;
        tracing::debug!("→ {} #{} {}", self.slots[target].endpoint, id, method);
        self.send(target, &line);

        if is_subscription(&method) {
            let extra = self.config.fan_out(verified.len() - 1);
            let others: Vec<usize> = (1..verified.len()).map(|k| verified[(position + k) % verified.len()]).take(extra).collect();
            for slot in others {
                let copy_id = self.next_id();
                let copy = encode_request(copy_id, &method, &params);
                self.send(slot, &copy);
                self.pending.insert(copy_id, Pending { slot, method: method.clone(), params: params.clone(), line: copy, kind: PendingKind::Redundant });
            }
        }
        self.pending.insert(id, Pending { slot: target, method, params, line, kind: PendingKind::Caller(reply) });
    }

    fn send(&self, slot: usize, line: &str) {
        if let Some(tasks) = &self.slots[slot].tasks {
            // A failed send means the writer is gone; its Closed event follows.
            let _ = tasks.writer.send(line.to_string());
        }
    }

    fn send_internal(&mut self, slot: usize, method: &str, params: Value, kind: PendingKind) {
        let id = self.next_id();
        let line = encode_request(id, method, &params);
        self.send(slot, &line);
        self.pending.insert(id, Pending { slot, method: method.to_string(), params, line, kind });
    }

    fn dial(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.state = ConnectionState::Connecting;
        slot.generation += 1;
        let generation = slot.generation;
        let endpoint = slot.endpoint.clone();
        let factory = Arc::clone(&self.factory);
        let inbound = self.inbound_tx.clone();
        let timeout = self.config.connect_timeout;
        tracing::info!("Connecting to {}", endpoint);

        tokio::spawn(async move {
            let event = match time::timeout(timeout, factory.connect(&endpoint)).await {
                Ok(Ok(stream)) => ConnectionEvent::Connected(stream),
                Ok(Err(e)) => ConnectionEvent::ConnectFailed(e.to_string()),
                Err(_) => ConnectionEvent::ConnectFailed("connect timed out".into()),
            };
            let _ = inbound.send(Inbound { slot: index, generation, event });
        });
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound { slot, generation, event } = inbound;
        if self.slots.get(slot).map(|s| s.generation) != Some(generation) {
            return;
        }
        match event {
            ConnectionEvent::Connected(stream) => self.on_connected(slot, stream),
            ConnectionEvent::ConnectFailed(reason) => self.close_slot(slot, &reason),
            ConnectionEvent::Closed(reason) => self.close_slot(slot, &reason),
            ConnectionEvent::Line(line) => self.on_line(slot, &line),
        }
    }

    fn on_connected(&mut self, index: usize, stream: BoxedStream) {
        if self.slots[index].state != ConnectionState::Connecting {
            return;
        }
        let generation = self.slots[index].generation;
        let tasks = spawn_connection(stream, index, generation, self.config.max_line_length, self.inbound_tx.clone());
        let slot = &mut self.slots[index];
        slot.tasks = Some(tasks);
        slot.state = ConnectionState::Ready;
        slot.ready_at = Some(Instant::now());
        tracing::info!("Connected to {}, handshaking", slot.endpoint);

        let version = json!([self.config.client_name, self.config.protocol_version]);
        self.send_internal(index, "server.version", version, PendingKind::Version);
        self.send_internal(index, "blockchain.headers.subscribe", json!([]), PendingKind::Headers);
    }

    fn on_line(&mut self, slot: usize, line: &str) {
        match parse_incoming(line) {
            Ok(Incoming::Response { id, result }) => self.on_response(slot, id, result),
            Ok(Incoming::Notification { method, params }) => self.on_notification(slot, &method, params),
            Err(e) => tracing::warn!("Ignoring malformed line from {}: {}", self.slots[slot].endpoint, e),
        }
    }

    fn on_response(&mut self, slot: usize, id: u64, result: Result<Value, ElectrumError>) {
        let Some(pending) = self.pending.remove(&id) else {
            tracing::debug!("Response #{} from {} matches nothing in flight", id, self.slots[slot].endpoint);
            return;
        };
        tracing::debug!("← {} #{} {}", self.slots[slot].endpoint, id, pending.method);

        match pending.kind {
            PendingKind::Caller(reply) => {
                if let (Topic::ScriptHash, Ok(status)) = (Topic::from_method(&pending.method), &result) {
                    if let Some(key) = pending.params.get(0).and_then(Value::as_str) {
                        self.statuses.insert(key.to_string(), status.as_str().map(str::to_string));
                    }
                }
                let _ = reply.send(result);
            }
            PendingKind::Redundant => {}
            PendingKind::Ping => self.slots[slot].ping_pending = false,
            PendingKind::Version => match result {
                Ok(_) => {
                    self.slots[slot].version_ok = true;
                    self.try_verify(slot);
                }
                Err(e) => self.close_slot(slot, &format!("version handshake rejected: {}", e)),
            },
            PendingKind::Headers => match result.as_ref().ok().and_then(header_height) {
                Some(height) => {
                    self.slots[slot].height = Some(height);
                    self.try_verify(slot);
                }
                None => self.close_slot(slot, "invalid headers.subscribe response"),
            },
        }
    }

    fn on_notification(&mut self, slot: usize, method: &str, params: Value) {
        match Topic::from_method(method) {
            Topic::ScriptHash | Topic::Address => {
                let Some(key) = params.get(0).and_then(Value::as_str) else {
                    tracing::warn!("Malformed {} notification from {}", method, self.slots[slot].endpoint);
                    return;
                };
                let status = params.get(1).and_then(Value::as_str).map(str::to_string);
                if self.statuses.get(key) == Some(&status) {
                    return;
                }
                self.statuses.insert(key.to_string(), status.clone());
                self.events.on_address_status_changed(key, status.as_deref());
            }
            Topic::Headers => match params.get(0).and_then(header_height) {
                Some(height) => self.observe_height(slot, height),
                None => tracing::warn!("Malformed headers notification from {}", self.slots[slot].endpoint),
            },
            Topic::Other(other) => tracing::debug!("Unhandled notification {} from {}", other, self.slots[slot].endpoint),
        }
    }

    /// Mark a handshaken connection verified if its tip is acceptable.
    fn try_verify(&mut self, index: usize) {
        let slot = &self.slots[index];
        if slot.verified || !slot.version_ok || slot.state != ConnectionState::Ready {
            return;
        }
        let Some(height) = slot.height else { return };

        if let Some(minimum) = self.config.last_known_height {
            if height < minimum {
                self.close_slot(index, &format!("height {} below last known {}", height, minimum));
                return;
            }
        }
        if height.saturating_add(self.config.max_height_lag) < self.max_height {
            self.close_slot(index, &format!("height {} lags best {}", height, self.max_height));
            return;
        }

        self.slots[index].verified = true;
        tracing::info!("Verified {} at height {}", self.slots[index].endpoint, height);
        self.raise_max_height(height);

        let queued: Vec<Queued> = self.queue.drain(..).collect();
        for request in queued {
            self.route(request);
        }
    }

    fn observe_height(&mut self, index: usize, height: u64) {
        self.slots[index].height = Some(height);
        if self.slots[index].verified {
            self.raise_max_height(height);
        } else {
            self.try_verify(index);
        }
    }

    /// A new best height re-checks every verified connection.
    fn raise_max_height(&mut self, height: u64) {
        if height <= self.max_height {
            return;
        }
        self.max_height = height;
        self.events.on_block_height_changed(height);
        self.close_lagging();
    }

    fn close_lagging(&mut self) {
        let lag = self.config.max_height_lag;
        let best = self.max_height;
        let lagging: Vec<usize> = (0..self.slots.len())
            .filter(|&i| self.slots[i].verified && self.slots[i].height.map_or(true, |h| h.saturating_add(lag) < best))
            .collect();
        for index in lagging {
            self.close_slot(index, &format!("fell more than {} blocks behind {}", lag, best));
        }
    }

    fn keep_alive(&mut self) {
        for index in self.verified_slots() {
            if !self.slots[index].verified {
                continue;
            }
            if self.slots[index].ping_pending {
                self.close_slot(index, "keep-alive ping unanswered");
            } else {
                self.slots[index].ping_pending = true;
                self.send_internal(index, "server.ping", json!([]), PendingKind::Ping);
            }
        }
    }

    fn sweep(&mut self) {
        self.close_lagging();

        let timeout = self.config.handshake_timeout;
        let stalled: Vec<usize> = (0..self.slots.len())
            .filter(|&i| {
                let s = &self.slots[i];
                s.state == ConnectionState::Ready && !s.verified && s.ready_at.map_or(false, |t| t.elapsed() >= timeout)
            })
            .collect();
        for index in stalled {
            self.close_slot(index, "handshake timed out");
        }

        if self.running {
            for index in 0..self.slots.len() {
                if self.slots[index].state == ConnectionState::Closed {
                    self.dial(index);
                }
            }
        }
    }

    /// Tear down one connection and move its caller requests elsewhere.
    fn close_slot(&mut self, index: usize, reason: &str) {
        let slot = &mut self.slots[index];
        if slot.state == ConnectionState::Closed {
            return;
        }
        tracing::warn!("Dropping {}: {}", slot.endpoint, reason);
        slot.reset();

        let mut bound: Vec<u64> = self.pending.iter().filter(|(_, p)| p.slot == index).map(|(&id, _)| id).collect();
        bound.sort_unstable();
        for id in bound {
            let Some(pending) = self.pending.remove(&id) else { continue };
            let PendingKind::Caller(reply) = pending.kind else { continue };
            self.migrate(Queued { id, method: pending.method, params: pending.params, line: pending.line, reply });
        }

        let live = self.slots.iter().any(|s| s.state != ConnectionState::Closed);
        if !live {
            self.fail_all(ElectrumError::NoLiveConnections);
            if self.running {
                self.running = false;
                tracing::warn!("All Electrum servers lost");
                self.events.on_disconnect();
            }
        }
    }

    /// Resend a caller request with its original id and bytes. No fan-out.
    fn migrate(&mut self, request: Queued) {
        let verified = self.verified_slots();
        if verified.is_empty() {
            self.route(request);
            return;
        }
        let target = verified[self.cursor % verified.len()];
        self.cursor = self.cursor.wrapping_add(1);
        tracing::debug!("Migrating #{} {} to {}", request.id, request.method, self.slots[target].endpoint);
        self.send(target, &request.line);
        self.pending.insert(
            request.id,
            Pending { slot: target, method: request.method, params: request.params, line: request.line, kind: PendingKind::Caller(request.reply) },
        );
    }

    fn fail_all(&mut self, error: ElectrumError) {
        for (_, pending) in self.pending.drain() {
            if let PendingKind::Caller(reply) = pending.kind {
                let _ = reply.send(Err(error.clone()));
            }
        }
        for queued in self.queue.drain(..) {
            let _ = queued.reply.send(Err(error.clone()));
        }
    }

    fn shutdown(&mut self) {
        self.running = false;
        for slot in &mut self.slots {
            slot.reset();
        }
        self.fail_all(ElectrumError::Shutdown);
    }
}

/// A zero period disables the timer.
fn ticker(period: Duration) -> Option<time::Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// `{"height": n, "hex": ...}` from headers.subscribe.
fn header_height(value: &Value) -> Option<u64> {
    value.get("height").and_then(Value::as_u64).or_else(|| value.get("block_height").and_then(Value::as_u64))
}
