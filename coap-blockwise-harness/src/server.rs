//! Background block-wise file server.
//!
//! # Architecture
//!
//! ```text
//!  scenario / CLI                         serving task
//!      │ store().register(..)              ┌────────────────────────────┐
//!      │ send_to_peer(msg) ──commands────▶ │ select! {                  │
//!      │ shutdown()                        │   command  → send / stop   │
//!      ▼                                   │   datagram → serve_request │
//!  FileServerHandle ◀── stats / history ── │ }                          │
//!                                          └─────────────┬──────────────┘
//!                                                        │
//!                 TransportEndpoint ◀── RetransmissionGate, sessions by path
//! ```
//!
//! Per request the loop
//! 1. skips anything that is not a request,
//! 2. re-sends the cached answer to a retransmission of the last answered
//!    confirmable request,
//! 3. records the request and asks the gate whether to drop it,
//! 4. finds or starts the [`BlockTransferSession`] for the path (4.04 if the
//!    store has nothing there),
//! 5. sends the next block.
//!
//! A [`ProtocolMismatch`](HarnessError::ProtocolMismatch) stops the loop;
//! [`FileServerHandle::shutdown`] returns it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::HarnessConfig;
use crate::endpoint::{Security, TransportEndpoint};
use crate::error::{HarnessError, Result};
use crate::gate::{RequestHistory, RequestRecord, RetransmissionGate};
use crate::message::{Code, Message};
use crate::session::BlockTransferSession;
use crate::store::{ResourceStore, StoreError};

/// Counters kept by the serving task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileServerStats {
    /// Requests seen, duplicates and drops included.
    pub received: usize,
    /// Requests the gate told us to ignore.
    pub dropped: usize,
    /// Duplicates answered from the response cache.
    pub duplicates: usize,
    /// Block responses sent.
    pub answered: usize,
    /// Transfers that reached their last block.
    pub completed: usize,
}

enum ServerCommand {
    SendToPeer(Message, oneshot::Sender<Result<()>>),
    Shutdown,
}

/// A bound, not yet running, file server.
pub struct FileServer {
    endpoint: TransportEndpoint,
    store: ResourceStore,
    history: RequestHistory,
    gate: Arc<dyn RetransmissionGate>,
    config: HarnessConfig,
}

impl FileServer {
    pub async fn bind(
        addr: SocketAddr,
        security: Security,
        gate: Arc<dyn RetransmissionGate>,
        config: HarnessConfig,
    ) -> Result<Self> {
        config.validate()?;
        let endpoint = TransportEndpoint::bind(addr, security).await?;
        Self::from_endpoint(endpoint, gate, config)
    }

    /// Serve from an already bound endpoint.  Fails on an invalid block
    /// size before anything is spawned.
    pub fn from_endpoint(
        endpoint: TransportEndpoint,
        gate: Arc<dyn RetransmissionGate>,
        config: HarnessConfig,
    ) -> Result<Self> {
        config.validate()?;
        let store = ResourceStore::new(endpoint.local_addr(), endpoint.scheme());
        Ok(Self {
            endpoint,
            store,
            history: RequestHistory::new(),
            gate,
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    /// Spawn the serving loop.
    pub fn run(self) -> FileServerHandle {
        let (command_tx, command_rx) = mpsc::channel(16);
        let stats = Arc::new(Mutex::new(FileServerStats::default()));
        let local_addr = self.endpoint.local_addr();
        let store = self.store.clone();
        let history = self.history.clone();

        let state = ServingState {
            store: self.store,
            history: self.history,
            gate: self.gate,
            block_size: self.config.block_size,
            idle_timeout: self.config.receive_timeout,
            sessions: HashMap::new(),
            last_answer: None,
            stats: Arc::clone(&stats),
        };
        log::info!("[server] serving on {local_addr}");
        let task = tokio::spawn(event_loop(self.endpoint, state, command_rx));

        FileServerHandle {
            local_addr,
            store,
            history,
            stats,
            commands: command_tx,
            task,
        }
    }
}

/// Handle to a running [`FileServer`].
pub struct FileServerHandle {
    local_addr: SocketAddr,
    store: ResourceStore,
    history: RequestHistory,
    stats: Arc<Mutex<FileServerStats>>,
    commands: mpsc::Sender<ServerCommand>,
    task: JoinHandle<Result<()>>,
}

impl FileServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    /// Every request the server has seen, dropped ones included.
    pub fn history(&self) -> &RequestHistory {
        &self.history
    }

    pub fn stats(&self) -> FileServerStats {
        *lock_stats(&self.stats)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Send `message` as is to whoever the server is talking to.
    pub async fn send_to_peer(&self, message: Message) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ServerCommand::SendToPeer(message, reply_tx))
            .await
            .map_err(|_| HarnessError::ServerTask("serving loop has stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| HarnessError::ServerTask("serving loop dropped the reply".into()))?
    }

    /// Stop the loop and report what it did.  A protocol error that ended
    /// the loop early is returned here.
    pub async fn shutdown(self) -> Result<FileServerStats> {
        // The loop may already be gone; its result is in the join handle.
        let _ = self.commands.send(ServerCommand::Shutdown).await;
        match self.task.await {
            Ok(Ok(())) => Ok(*lock_stats(&self.stats)),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(HarnessError::ServerTask(e.to_string())),
        }
    }
}

fn lock_stats(stats: &Mutex<FileServerStats>) -> MutexGuard<'_, FileServerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ServingState {
    store: ResourceStore,
    history: RequestHistory,
    gate: Arc<dyn RetransmissionGate>,
    block_size: usize,
    idle_timeout: std::time::Duration,
    sessions: HashMap<String, BlockTransferSession>,
    /// `(message id, token, response)` of the last answered CON request.
    last_answer: Option<(u16, Vec<u8>, Message)>,
    stats: Arc<Mutex<FileServerStats>>,
}

async fn event_loop(
    mut endpoint: TransportEndpoint,
    mut state: ServingState,
    mut commands: mpsc::Receiver<ServerCommand>,
) -> Result<()> {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(ServerCommand::SendToPeer(message, reply)) => {
                    let _ = reply.send(endpoint.send_message(&message).await);
                }
                Some(ServerCommand::Shutdown) | None => {
                    log::info!("[server] shutting down");
                    return Ok(());
                }
            },

            incoming = next_message(&mut endpoint, state.idle_timeout) => {
                match incoming {
                    Ok(message) => state.serve(&mut endpoint, message).await?,
                    Err(e) if e.is_timeout() => {
                        log::info!("[server] peer idle; accepting again");
                        endpoint.reset();
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

/// Next datagram from the peer, accepting a new one first if needed.
async fn next_message(
    endpoint: &mut TransportEndpoint,
    idle_timeout: std::time::Duration,
) -> Result<Message> {
    if !endpoint.is_connected() {
        endpoint.accept(None).await?;
    }
    endpoint.receive(Some(idle_timeout)).await
}

impl ServingState {
    async fn serve(&mut self, endpoint: &mut TransportEndpoint, request: Message) -> Result<()> {
        if !request.is_request() {
            log::debug!("[server] skipping non-request {request}");
            return Ok(());
        }
        self.bump(|s| s.received += 1);

        if let Some((id, token, response)) = &self.last_answer {
            if request.is_confirmable() && request.message_id == *id && request.token == *token {
                log::debug!("[server] duplicate {request}; re-sending cached answer");
                endpoint.send_message(response).await?;
                self.bump(|s| s.duplicates += 1);
                return Ok(());
            }
        }

        let prior = self.history.count_and_record(RequestRecord::from(&request));
        if self.gate.should_ignore(&request, prior) {
            log::debug!("[server] dropping {request} (seen {prior} times before)");
            self.bump(|s| s.dropped += 1);
            return Ok(());
        }

        if request.code != Code::GET {
            let response = Message::response_to(&request, Code::METHOD_NOT_ALLOWED);
            return self.answer(endpoint, &request, response).await;
        }

        let path = request.uri_path();
        if !self.sessions.contains_key(&path) {
            match self.store.get_resource(&path) {
                Ok(payload) => {
                    let session = BlockTransferSession::new(path.clone(), payload, self.block_size)?;
                    log::info!(
                        "[server] starting transfer of {path} ({} blocks)",
                        session.block_count()
                    );
                    self.sessions.insert(path.clone(), session);
                }
                Err(StoreError::NotFound(_)) => {
                    log::warn!("[server] {path} not found");
                    let response = Message::response_to(&request, Code::NOT_FOUND);
                    return self.answer(endpoint, &request, response).await;
                }
            }
        }

        let Some(session) = self.sessions.get_mut(&path) else {
            return Ok(());
        };
        let response = match session.handle(&request) {
            Ok(response) => response,
            Err(e) => {
                log::error!("[server] {path}: {e}");
                return Err(e);
            }
        };
        let complete = session.is_complete();
        self.answer(endpoint, &request, response).await?;
        self.bump(|s| s.answered += 1);

        if complete {
            self.sessions.remove(&path);
            self.bump(|s| s.completed += 1);
            log::info!("[server] transfer of {path} complete");
        }
        Ok(())
    }

    async fn answer(
        &mut self,
        endpoint: &mut TransportEndpoint,
        request: &Message,
        response: Message,
    ) -> Result<()> {
        let response = endpoint.correlate(request, response);
        endpoint.send_message(&response).await?;
        if request.is_confirmable() {
            self.last_answer = Some((request.message_id, request.token.clone(), response));
        }
        Ok(())
    }

    fn bump(&self, update: impl FnOnce(&mut FileServerStats)) {
        update(&mut lock_stats(&self.stats));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockOption;
    use crate::gate::{AlwaysAnswer, ModuloBackoff};
    use crate::socket::Socket;
    use std::time::Duration;

    async fn start(gate: Arc<dyn RetransmissionGate>) -> (FileServerHandle, Socket) {
        let server = FileServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Security::NoSec,
            gate,
            HarnessConfig::default(),
        )
        .await
        .unwrap();
        let client = Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (server.run(), client)
    }

    async fn exchange(client: &Socket, server: SocketAddr, request: &Message) -> Option<Message> {
        client.send_to(request, server).await.unwrap();
        tokio::time::timeout(Duration::from_millis(200), client.recv_from())
            .await
            .ok()
            .map(|r| r.unwrap().0)
    }

    fn block_get(path: &str, id: u16, seq: u32) -> Message {
        let mut req = Message::get(path).with_token(vec![id as u8]);
        req.message_id = id;
        if seq > 0 {
            req.set_block2(BlockOption::new(seq, 1024, false).unwrap());
        }
        req
    }

    #[tokio::test]
    async fn serves_registered_resource() {
        let (server, client) = start(Arc::new(AlwaysAnswer)).await;
        let payload: Vec<u8> = (0..3000).map(|i| i as u8).collect();
        server.store().set_resource("/file", payload.clone());

        let mut received = Vec::new();
        for seq in 0..3 {
            let resp = exchange(&client, server.local_addr(), &block_get("/file", seq as u16 + 1, seq))
                .await
                .unwrap();
            assert_eq!(resp.code, Code::CONTENT);
            received.extend_from_slice(&resp.payload);
        }
        assert_eq!(received, payload);

        let stats = server.shutdown().await.unwrap();
        assert_eq!(stats.answered, 3);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (server, client) = start(Arc::new(AlwaysAnswer)).await;
        let resp = exchange(&client, server.local_addr(), &block_get("/missing", 1, 0))
            .await
            .unwrap();
        assert_eq!(resp.code, Code::NOT_FOUND);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn gate_drops_then_answers() {
        let (server, client) = start(Arc::new(ModuloBackoff::default())).await;
        server.store().set_resource("/file", vec![0u8; 4096]);
        exchange(&client, server.local_addr(), &block_get("/file", 1, 0)).await.unwrap();

        let second = block_get("/file", 2, 1);
        assert!(exchange(&client, server.local_addr(), &second).await.is_none());
        assert!(exchange(&client, server.local_addr(), &second).await.is_some());

        let history = server.history().clone();
        let stats = server.shutdown().await.unwrap();
        assert_eq!(stats.dropped, 1);
        assert_eq!(history.len(), 3);
    }

    #[tokio::test]
    async fn duplicate_is_answered_from_cache() {
        let (server, client) = start(Arc::new(AlwaysAnswer)).await;
        server.store().set_resource("/file", vec![1u8; 2048]);
        let first = block_get("/file", 9, 0);
        let a = exchange(&client, server.local_addr(), &first).await.unwrap();
        let b = exchange(&client, server.local_addr(), &first).await.unwrap();
        assert_eq!(a, b);

        let stats = server.shutdown().await.unwrap();
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.answered, 1);
    }

    #[tokio::test]
    async fn out_of_order_block_stops_the_server() {
        let (server, client) = start(Arc::new(AlwaysAnswer)).await;
        server.store().set_resource("/file", vec![1u8; 4096]);
        exchange(&client, server.local_addr(), &block_get("/file", 1, 0)).await.unwrap();
        assert!(exchange(&client, server.local_addr(), &block_get("/file", 2, 3)).await.is_none());

        crate::timer::wait_until(Duration::from_secs(1), Duration::from_millis(5), "loop exit", || {
            let finished = server.is_finished();
            async move { finished }
        })
        .await
        .unwrap();
        assert_eq!(server.stats().answered, 1);

        let err = server.shutdown().await.unwrap_err();
        assert!(matches!(err, HarnessError::ProtocolMismatch(_)));
    }

    #[tokio::test]
    async fn invalid_block_size_is_rejected_before_serving() {
        let endpoint = TransportEndpoint::bind("127.0.0.1:0".parse().unwrap(), Security::NoSec)
            .await
            .unwrap();
        let config = HarnessConfig::default().with_block_size(1000);
        let err = FileServer::from_endpoint(endpoint, Arc::new(AlwaysAnswer), config)
            .err()
            .expect("block size 1000 accepted");
        assert!(matches!(err, HarnessError::Block(_)));
    }

    #[tokio::test]
    async fn send_to_peer_reaches_the_client() {
        let (server, client) = start(Arc::new(AlwaysAnswer)).await;
        server.store().set_resource("/file", vec![1u8; 4096]);
        exchange(&client, server.local_addr(), &block_get("/file", 1, 0)).await.unwrap();

        server.send_to_peer(Message::get("/3/0/2")).await.unwrap();
        let (unsolicited, _) = client.recv_from().await.unwrap();
        assert_eq!(unsolicited.uri_path(), "/3/0/2");
        server.shutdown().await.unwrap();
    }
}
