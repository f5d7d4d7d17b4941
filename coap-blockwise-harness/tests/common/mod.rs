//! In-process reference downloader driven through [`ClientControl`].
//!
//! It behaves like a constrained-device download client: confirmable GETs
//! with BLOCK2, exponential retransmission, rebinding to a fresh port on
//! reconnect or after going offline, and an optional control socket that
//! answers the harness's control requests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout_at, Instant};

use coap_blockwise_harness::block::BlockOption;
use coap_blockwise_harness::lifecycle::{ClientCommand, ClientControl, Transport};
use coap_blockwise_harness::message::{Code, Message, MessageType};
use coap_blockwise_harness::socket::Socket;
use coap_blockwise_harness::{HarnessConfig, HarnessError, Result};

pub const MAX_RETRANSMIT: u32 = 4;

/// Harness timings sized for loopback.
pub fn test_config() -> HarnessConfig {
    HarnessConfig {
        accept_timeout: Duration::from_secs(2),
        offline_window: Duration::from_millis(500),
        receive_timeout: Duration::from_secs(2),
        socket_count_timeout: Duration::from_secs(1),
        completion_timeout: Duration::from_secs(20),
        poll_interval: Duration::from_millis(10),
        ..HarnessConfig::default()
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Download destination inside a private temporary directory.  The
/// directory and whatever the client wrote go away when this is dropped,
/// panics included.
pub struct TempDest {
    _dir: TempDir,
    path: PathBuf,
}

impl Deref for TempDest {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.path
    }
}

pub fn temp_dest(tag: &str) -> TempDest {
    let dir = tempfile::Builder::new()
        .prefix(&format!("coap-blockwise-{tag}-"))
        .tempdir()
        .expect("create temp dir");
    let path = dir.path().join("download.bin");
    TempDest { _dir: dir, path }
}

#[derive(Debug, Clone)]
pub struct ClientProfile {
    /// Initial retransmission timeout; doubles on every retry.
    pub ack_timeout: Duration,
    /// How long the download socket stays open after the file is written.
    pub linger: Duration,
    /// Misbehave: answer `reconnect` by resending from the same port.
    pub keep_port_on_reconnect: bool,
    /// Misbehave: send one more request right after going offline.
    pub talk_while_offline: bool,
    /// Misbehave: ask for block 0 again after reconnecting or coming back
    /// online.
    pub restart_on_reconnect: bool,
}

impl Default for ClientProfile {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(100),
            linger: Duration::from_millis(200),
            keep_port_on_reconnect: false,
            talk_while_offline: false,
            restart_on_reconnect: false,
        }
    }
}

#[derive(Debug, Default)]
struct ClientState {
    control_sockets: usize,
    download_sockets: usize,
    commands: Vec<String>,
    last_psk: Option<(String, String)>,
    requests_sent: usize,
    stray_requests: usize,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Shared(Arc<Mutex<ClientState>>);

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Decrements a socket counter when dropped.
struct SocketGuard {
    shared: Shared,
    control: bool,
}

impl SocketGuard {
    fn open(shared: &Shared, control: bool) -> Self {
        let mut state = shared.lock();
        if control {
            state.control_sockets += 1;
        } else {
            state.download_sockets += 1;
        }
        drop(state);
        Self {
            shared: shared.clone(),
            control,
        }
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if self.control {
            state.control_sockets -= 1;
        } else {
            state.download_sockets -= 1;
        }
    }
}

enum Signal {
    Reconnect(oneshot::Sender<()>),
    EnterOffline(oneshot::Sender<()>),
    ExitOffline(oneshot::Sender<()>),
}

struct RunningDownload {
    signals: mpsc::Sender<Signal>,
    task: JoinHandle<()>,
}

pub struct ReferenceClient {
    shared: Shared,
    profile: ClientProfile,
    control: Option<JoinHandle<()>>,
    download: Option<RunningDownload>,
}

impl ReferenceClient {
    pub fn new() -> Self {
        Self::with_profile(ClientProfile::default())
    }

    pub fn with_profile(profile: ClientProfile) -> Self {
        Self {
            shared: Shared::default(),
            profile,
            control: None,
            download: None,
        }
    }

    /// Open a control socket, announce it to `server` with a NON POST, and
    /// answer every confirmable request arriving on it.
    pub async fn with_control(server: SocketAddr) -> Self {
        let mut client = Self::new();
        let socket = Socket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .expect("bind control socket");
        let guard = SocketGuard::open(&client.shared, true);

        let mut hello = Message::new(MessageType::NonConfirmable, Code::POST, rand::random());
        hello.set_uri_path("/rd");
        socket.send_to(&hello, server).await.expect("send registration");

        client.control = Some(tokio::spawn(async move {
            let _guard = guard;
            while let Ok((request, from)) = socket.recv_from().await {
                if !request.is_request() || !request.is_confirmable() {
                    continue;
                }
                let response = Message::response_to(&request, Code::CONTENT).with_payload(b"86400".to_vec());
                if socket.send_to(&response, from).await.is_err() {
                    break;
                }
            }
        }));
        client
    }

    pub fn commands(&self) -> Vec<String> {
        self.shared.lock().commands.clone()
    }

    pub fn last_psk(&self) -> Option<(String, String)> {
        self.shared.lock().last_psk.clone()
    }

    pub fn requests_sent(&self) -> usize {
        self.shared.lock().requests_sent
    }

    pub fn stray_requests(&self) -> usize {
        self.shared.lock().stray_requests
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    async fn start_download(&mut self, uri: &str, dest: PathBuf) -> Result<()> {
        let (server, path) = parse_uri(uri)?;
        let socket = Socket::bind("127.0.0.1:0".parse().unwrap()).await?;
        let guard = SocketGuard::open(&self.shared, false);

        let mut request = Message::get(&path);
        refresh_correlation(&mut request);
        socket.send_to(&request, server).await?;
        self.shared.lock().requests_sent += 1;

        let (signals_tx, signals_rx) = mpsc::channel(4);
        let download = Download {
            socket,
            server,
            path,
            dest,
            request,
            signals: signals_rx,
            shared: self.shared.clone(),
            profile: self.profile.clone(),
        };
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            let linger = download.profile.linger;
            if let Err(e) = download.run().await {
                log::warn!("[client] download failed: {e}");
                shared.lock().last_error = Some(e);
            }
            sleep(linger).await;
            drop(guard);
        });
        self.download = Some(RunningDownload {
            signals: signals_tx,
            task,
        });
        Ok(())
    }

    async fn signal(&mut self, make: fn(oneshot::Sender<()>) -> Signal) -> Result<()> {
        let Some(download) = &self.download else {
            return Err(HarnessError::Client("no download in progress".into()));
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        download
            .signals
            .send(make(ack_tx))
            .await
            .map_err(|_| HarnessError::Client("download already finished".into()))?;
        ack_rx
            .await
            .map_err(|_| HarnessError::Client("download stopped before acknowledging".into()))
    }
}

impl Drop for ReferenceClient {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            control.abort();
        }
        if let Some(download) = self.download.take() {
            download.task.abort();
        }
    }
}

impl ClientControl for ReferenceClient {
    async fn communicate(&mut self, command: ClientCommand) -> Result<()> {
        // Round-trip through the line format.
        let line = command.to_string();
        self.shared.lock().commands.push(line.clone());
        match line.parse::<ClientCommand>()? {
            ClientCommand::Download { uri, dest, psk } => {
                self.shared.lock().last_psk = psk;
                self.start_download(&uri, dest).await
            }
            ClientCommand::Reconnect(Transport::Udp) => self.signal(Signal::Reconnect).await,
            ClientCommand::EnterOffline(Transport::Udp) => self.signal(Signal::EnterOffline).await,
            ClientCommand::ExitOffline(Transport::Udp) => self.signal(Signal::ExitOffline).await,
            ClientCommand::Reconnect(t) | ClientCommand::EnterOffline(t) | ClientCommand::ExitOffline(t) => {
                Err(HarnessError::Client(format!("transport {t} not supported")))
            }
            ClientCommand::RemoveServer => {
                if let Some(control) = self.control.take() {
                    control.abort();
                    let _ = control.await;
                }
                Ok(())
            }
        }
    }

    async fn socket_count(&self) -> Result<usize> {
        let state = self.shared.lock();
        Ok(state.control_sockets + state.download_sockets)
    }

    async fn socket_transport(&self, index: usize) -> Result<Transport> {
        let count = self.socket_count().await?;
        if index < count {
            Ok(Transport::Udp)
        } else {
            Err(HarnessError::Client(format!("no socket at index {index}")))
        }
    }
}

fn parse_uri(uri: &str) -> Result<(SocketAddr, String)> {
    let rest = uri
        .strip_prefix("coaps://")
        .or_else(|| uri.strip_prefix("coap://"))
        .ok_or_else(|| HarnessError::Client(format!("unsupported URI {uri}")))?;
    let (authority, path) = match rest.find('/') {
        Some(at) => rest.split_at(at),
        None => (rest, "/"),
    };
    let server = authority
        .parse()
        .map_err(|_| HarnessError::Client(format!("bad authority in {uri}")))?;
    Ok((server, path.to_string()))
}

fn refresh_correlation(request: &mut Message) {
    let mut rng = rand::rng();
    request.message_id = rng.random();
    request.token = rng.random::<[u8; 4]>().to_vec();
}

struct Download {
    socket: Socket,
    server: SocketAddr,
    path: String,
    dest: PathBuf,
    request: Message,
    signals: mpsc::Receiver<Signal>,
    shared: Shared,
    profile: ClientProfile,
}

impl Download {
    async fn run(mut self) -> std::result::Result<(), String> {
        let mut body = Vec::new();
        let mut seq_num = 0u32;
        loop {
            let response = self.exchange().await?;
            if response.code != Code::CONTENT {
                return Err(format!("server answered {}", response.code));
            }
            let block = response.block2().map_err(|e| e.to_string())?;
            body.extend_from_slice(&response.payload);
            match block {
                Some(block) if block.seq_num != seq_num => {
                    return Err(format!("expected block {seq_num}, got {}", block.seq_num));
                }
                Some(block) if block.has_more => {
                    seq_num += 1;
                    let next = BlockOption::new(seq_num, block.block_size, false).map_err(|e| e.to_string())?;
                    self.request = Message::get(&self.path).with_block2(next);
                    refresh_correlation(&mut self.request);
                    self.send_request().await?;
                }
                _ => break,
            }
        }
        tokio::fs::write(&self.dest, &body)
            .await
            .map_err(|e| e.to_string())?;
        log::debug!("[client] wrote {} bytes to {}", body.len(), self.dest.display());
        Ok(())
    }

    async fn send_request(&mut self) -> std::result::Result<(), String> {
        self.socket
            .send_to(&self.request, self.server)
            .await
            .map_err(|e| e.to_string())?;
        self.shared.lock().requests_sent += 1;
        Ok(())
    }

    /// Move to a fresh ephemeral port; the old socket is closed only after
    /// the new one is bound, so the port always changes.
    async fn rebind(&mut self) -> std::result::Result<(), String> {
        if self.profile.keep_port_on_reconnect {
            refresh_correlation(&mut self.request);
            return self.send_request().await;
        }
        let fresh = Socket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .map_err(|e| e.to_string())?;
        let old = std::mem::replace(&mut self.socket, fresh);
        log::debug!("[client] rebound {} -> {}", old.local_addr, self.socket.local_addr);
        drop(old);
        if self.profile.restart_on_reconnect {
            if let Ok(Some(block)) = self.request.block2() {
                let first = BlockOption::new(0, block.block_size, false).map_err(|e| e.to_string())?;
                self.request = Message::get(&self.path).with_block2(first);
            }
        }
        refresh_correlation(&mut self.request);
        self.send_request().await
    }

    /// Wait for the answer to the current request, retransmitting it and
    /// reacting to control signals meanwhile.
    async fn exchange(&mut self) -> std::result::Result<Message, String> {
        let mut retransmissions = 0;
        let mut wait = self.profile.ack_timeout;
        let mut deadline = Instant::now() + wait;
        loop {
            tokio::select! {
                signal = self.signals.recv() => match signal {
                    Some(Signal::Reconnect(ack)) => {
                        self.rebind().await?;
                        let _ = ack.send(());
                    }
                    Some(Signal::EnterOffline(ack)) => {
                        let _ = ack.send(());
                        self.stay_offline().await?;
                    }
                    Some(Signal::ExitOffline(ack)) => {
                        let _ = ack.send(());
                        continue;
                    }
                    None => return Err("control handle dropped".into()),
                },
                received = timeout_at(deadline, self.socket.recv_from()) => match received {
                    Err(_) => {
                        retransmissions += 1;
                        if retransmissions > MAX_RETRANSMIT {
                            return Err(format!("no answer to {} after {MAX_RETRANSMIT} retransmissions", self.request));
                        }
                        self.send_request().await?;
                        wait *= 2;
                        deadline = Instant::now() + wait;
                        continue;
                    }
                    Ok(Err(e)) => return Err(e.to_string()),
                    Ok(Ok((message, from))) => {
                        if message.is_request() {
                            self.shared.lock().stray_requests += 1;
                            if message.is_confirmable() {
                                let reset = Message::new(MessageType::Reset, Code::EMPTY, message.message_id);
                                let _ = self.socket.send_to(&reset, from).await;
                            }
                            continue;
                        }
                        if from == self.server && message.token == self.request.token && message.code.is_response() {
                            return Ok(message);
                        }
                        continue;
                    }
                }
            }
            // A signal restarted the exchange from a new socket.
            retransmissions = 0;
            wait = self.profile.ack_timeout;
            deadline = Instant::now() + wait;
        }
    }

    /// Send nothing until told to come back, then rebind and resend.
    async fn stay_offline(&mut self) -> std::result::Result<(), String> {
        log::debug!("[client] offline");
        if self.profile.talk_while_offline {
            self.send_request().await?;
        }
        loop {
            match self.signals.recv().await {
                Some(Signal::ExitOffline(ack)) => {
                    self.rebind().await?;
                    let _ = ack.send(());
                    log::debug!("[client] online");
                    return Ok(());
                }
                Some(Signal::Reconnect(ack)) | Some(Signal::EnterOffline(ack)) => {
                    let _ = ack.send(());
                }
                None => return Err("control handle dropped".into()),
            }
        }
    }
}
