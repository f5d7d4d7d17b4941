//! Driving the client under test through connection lifecycle events.
//!
//! The client is reached only through [`ClientControl`]: line commands plus
//! two accessors for its open sockets.  [`LifecycleController`] owns the
//! download endpoint, answers block requests by hand, and injects resets:
//!
//! ```text
//!  download_context ── join!(accept, "download …") ── socket count == 1
//!        │
//!  transfer_data(limit) ── expect_request ── reconnect | offline_then_online
//!        │
//!  transfer_data(all) ── finish: socket count == 0, file == payload
//! ```
//!
//! The download command only returns once the client has connected, so it
//! always runs concurrently with `accept`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::HarnessConfig;
use crate::endpoint::{ConnectionHandle, TransportEndpoint};
use crate::error::{HarnessError, Result};
use crate::message::Message;
use crate::session::BlockTransferSession;
use crate::store::{normalize_path, ResourceStore};
use crate::timer;

/// Transport named in reconnect and offline commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for Transport {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            other => Err(HarnessError::Client(format!("unknown transport {other:?}"))),
        }
    }
}

/// One line of the client's control protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// `download <uri> <dest> [psk_identity] [psk_key]`; returns once the
    /// client has opened its download socket and sent the first request.
    Download {
        uri: String,
        dest: PathBuf,
        psk: Option<(String, String)>,
    },
    /// `reconnect <transport>`
    Reconnect(Transport),
    /// `enter-offline <transport>`
    EnterOffline(Transport),
    /// `exit-offline <transport>`
    ExitOffline(Transport),
    /// `remove-server`
    RemoveServer,
}

impl std::fmt::Display for ClientCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientCommand::Download { uri, dest, psk } => {
                write!(f, "download {uri} {}", dest.display())?;
                if let Some((identity, key)) = psk {
                    write!(f, " {identity} {key}")?;
                }
                Ok(())
            }
            ClientCommand::Reconnect(t) => write!(f, "reconnect {t}"),
            ClientCommand::EnterOffline(t) => write!(f, "enter-offline {t}"),
            ClientCommand::ExitOffline(t) => write!(f, "exit-offline {t}"),
            ClientCommand::RemoveServer => write!(f, "remove-server"),
        }
    }
}

impl FromStr for ClientCommand {
    type Err = HarnessError;

    fn from_str(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let bad = || HarnessError::Client(format!("malformed command {line:?}"));
        let transport = |words: &[&str]| match words {
            [t] => t.parse::<Transport>(),
            _ => Err(bad()),
        };
        match words.split_first() {
            Some((&"download", rest)) => match rest {
                [uri, dest] => Ok(ClientCommand::Download {
                    uri: uri.to_string(),
                    dest: PathBuf::from(*dest),
                    psk: None,
                }),
                [uri, dest, identity, key] => Ok(ClientCommand::Download {
                    uri: uri.to_string(),
                    dest: PathBuf::from(*dest),
                    psk: Some((identity.to_string(), key.to_string())),
                }),
                _ => Err(bad()),
            },
            Some((&"reconnect", rest)) => transport(rest).map(ClientCommand::Reconnect),
            Some((&"enter-offline", rest)) => transport(rest).map(ClientCommand::EnterOffline),
            Some((&"exit-offline", rest)) => transport(rest).map(ClientCommand::ExitOffline),
            Some((&"remove-server", [])) => Ok(ClientCommand::RemoveServer),
            _ => Err(bad()),
        }
    }
}

/// Control channel to the client under test.
pub trait ClientControl {
    /// Deliver one command and wait for the client to acknowledge it.
    fn communicate(&mut self, command: ClientCommand) -> impl Future<Output = Result<()>> + Send;

    /// Number of sockets the client currently has open.
    fn socket_count(&self) -> impl Future<Output = Result<usize>> + Send;

    /// Transport of the client's `index`-th open socket.
    fn socket_transport(&self, index: usize) -> impl Future<Output = Result<Transport>> + Send;
}

impl<C: ClientControl + ?Sized> ClientControl for &mut C {
    fn communicate(&mut self, command: ClientCommand) -> impl Future<Output = Result<()>> + Send {
        (**self).communicate(command)
    }

    fn socket_count(&self) -> impl Future<Output = Result<usize>> + Send {
        (**self).socket_count()
    }

    fn socket_transport(&self, index: usize) -> impl Future<Output = Result<Transport>> + Send {
        (**self).socket_transport(index)
    }
}

/// A download in progress, driven block by block.
#[derive(Debug)]
pub struct DownloadContext {
    dest: PathBuf,
    session: BlockTransferSession,
}

impl DownloadContext {
    pub fn path(&self) -> &str {
        self.session.path()
    }

    pub fn payload(&self) -> &Arc<[u8]> {
        self.session.payload()
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn seq_num(&self) -> u32 {
        self.session.expected_seq_num()
    }

    pub fn block_size(&self) -> usize {
        self.session.block_size()
    }

    pub fn read_offset(&self) -> usize {
        self.session.read_offset()
    }

    pub fn session(&self) -> &BlockTransferSession {
        &self.session
    }
}

/// Owns the download endpoint and the client; sequences resets and
/// re-accepts around a hand-driven transfer.
pub struct LifecycleController<C> {
    endpoint: TransportEndpoint,
    client: C,
    config: HarnessConfig,
    store: ResourceStore,
}

impl<C: ClientControl> LifecycleController<C> {
    pub fn new(endpoint: TransportEndpoint, client: C, config: HarnessConfig) -> Self {
        let store = ResourceStore::new(endpoint.local_addr(), endpoint.scheme());
        Self {
            endpoint,
            client,
            config,
            store,
        }
    }

    pub fn endpoint(&self) -> &TransportEndpoint {
        &self.endpoint
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn store(&self) -> &ResourceStore {
        &self.store
    }

    /// Register `payload` at `path`, start the client's download into
    /// `dest`, and wait until it has exactly one socket open.
    ///
    /// PSK credentials of the endpoint, if any, are passed along with the
    /// command.
    pub async fn download_context(
        &mut self,
        path: &str,
        payload: impl Into<Arc<[u8]>>,
        dest: impl Into<PathBuf>,
    ) -> Result<DownloadContext> {
        let payload: Arc<[u8]> = payload.into();
        let path = normalize_path(path);
        let dest = dest.into();
        let uri = self.store.register(&path, Arc::clone(&payload));
        let session = BlockTransferSession::new(path, payload, self.config.block_size)?;

        let psk = self.endpoint.security().credentials().map(|(identity, key)| {
            (
                String::from_utf8_lossy(identity).into_owned(),
                String::from_utf8_lossy(key).into_owned(),
            )
        });
        let command = ClientCommand::Download {
            uri,
            dest: dest.clone(),
            psk,
        };
        log::info!("[lifecycle] {command}");

        let (accepted, commanded) = tokio::join!(
            self.endpoint.accept(Some(self.config.accept_timeout)),
            self.client.communicate(command),
        );
        commanded?;
        let peer = accepted?;
        log::info!("[lifecycle] client connected from {peer}");

        self.wait_for_socket_count(1, self.config.socket_count_timeout)
            .await?;
        Ok(DownloadContext { dest, session })
    }

    /// Answer block requests until the read offset reaches `bytes_limit` or
    /// the transfer completes.
    pub async fn transfer_data(&mut self, ctx: &mut DownloadContext, bytes_limit: usize) -> Result<()> {
        while ctx.read_offset() < bytes_limit && !ctx.session.is_complete() {
            let request = self.next_request().await?;
            let response = ctx.session.handle(&request)?;
            self.endpoint.send(&request, response).await?;
        }
        log::debug!(
            "[lifecycle] transferred up to offset {} of {}",
            ctx.read_offset(),
            ctx.payload().len()
        );
        Ok(())
    }

    /// Receive the next block request and check it, without answering.
    pub async fn expect_request(&mut self, ctx: &DownloadContext) -> Result<Message> {
        let request = self.next_request().await?;
        let block = ctx.session.check(&request)?;
        log::debug!("[lifecycle] got expected request for block {}", block.seq_num);
        Ok(request)
    }

    /// Drop the connection, tell the client to reconnect, and accept it
    /// again.  Returns the new handle, which must differ from the old one.
    pub async fn reconnect(&mut self) -> Result<ConnectionHandle> {
        let previous = self.endpoint.remote_handle()?;
        self.endpoint.reset();
        self.client
            .communicate(ClientCommand::Reconnect(Transport::Udp))
            .await?;
        let current = self
            .endpoint
            .accept(Some(self.config.accept_timeout))
            .await?;
        ensure_rebound(previous, current)
    }

    /// Drop the connection and send the client offline; no traffic may
    /// arrive during the offline window.  Then bring it back and accept it
    /// on a new handle.
    pub async fn offline_then_online(&mut self) -> Result<ConnectionHandle> {
        let previous = self.endpoint.remote_handle()?;
        self.endpoint.reset();
        self.client
            .communicate(ClientCommand::EnterOffline(Transport::Udp))
            .await?;

        match self.endpoint.accept(Some(self.config.offline_window)).await {
            Ok(handle) => {
                return Err(HarnessError::UnexpectedTraffic(format!(
                    "{handle} sent data while offline"
                )))
            }
            Err(e) if e.is_timeout() => {
                log::debug!("[lifecycle] silent for {:?} as expected", self.config.offline_window);
            }
            Err(e) => return Err(e),
        }

        self.client
            .communicate(ClientCommand::ExitOffline(Transport::Udp))
            .await?;
        let current = self
            .endpoint
            .accept(Some(self.config.accept_timeout))
            .await?;
        ensure_rebound(previous, current)
    }

    /// Wait for the client to close its download socket, then compare the
    /// file it wrote with the payload.
    pub async fn finish(&mut self, ctx: DownloadContext) -> Result<()> {
        self.wait_for_socket_count(0, self.config.completion_timeout)
            .await?;
        verify_download(ctx.dest(), ctx.payload()).await
    }

    async fn wait_for_socket_count(&self, expected: usize, limit: std::time::Duration) -> Result<()> {
        wait_for_socket_count(&self.client, expected, limit, self.config.poll_interval).await
    }

    async fn next_request(&mut self) -> Result<Message> {
        loop {
            let message = self
                .endpoint
                .receive(Some(self.config.receive_timeout))
                .await?;
            if message.is_request() {
                return Ok(message);
            }
            log::debug!("[lifecycle] skipping {message}");
        }
    }
}

fn ensure_rebound(previous: ConnectionHandle, current: ConnectionHandle) -> Result<ConnectionHandle> {
    if current.remote_port == previous.remote_port {
        return Err(HarnessError::UnchangedRemote(current));
    }
    log::info!("[lifecycle] client moved from {previous} to {current}");
    Ok(current)
}

/// Poll the client until it reports `expected` open sockets.
pub async fn wait_for_socket_count<C: ClientControl>(
    client: &C,
    expected: usize,
    limit: std::time::Duration,
    interval: std::time::Duration,
) -> Result<()> {
    timer::wait_for(limit, interval, &format!("client socket count {expected}"), || async move {
        Ok::<_, HarnessError>(client.socket_count().await? == expected)
    })
    .await
}

/// Compare the file at `dest` with `expected`.
pub async fn verify_download(dest: &Path, expected: &[u8]) -> Result<()> {
    let written = tokio::fs::read(dest).await?;
    if written != expected {
        return Err(HarnessError::PayloadMismatch {
            expected: expected.len(),
            actual: written.len(),
        });
    }
    log::info!("[lifecycle] {} matches ({} bytes)", dest.display(), written.len());
    Ok(())
}

/// Exchange `config.control_rounds` requests with the client's control
/// socket, each within `config.control_deadline`.
///
/// If `control` has no peer yet, the client's first datagram (typically a
/// registration) is accepted and consumed.
pub async fn verify_control_traffic(control: &mut TransportEndpoint, config: &HarnessConfig) -> Result<()> {
    if !control.is_connected() {
        control.accept(Some(config.accept_timeout)).await?;
        let hello = control.receive(Some(config.receive_timeout)).await?;
        log::debug!("[lifecycle] control peer said {hello}");
    }

    for round in 0..config.control_rounds {
        let started = Instant::now();
        let response = control
            .request(Message::get("/1/0/1"), config.control_deadline)
            .await?;
        if response.code.class() != 2 {
            return Err(HarnessError::Client(format!(
                "control round {round} answered with {}",
                response.code
            )));
        }
        log::debug!("[lifecycle] control round {round} took {:?}", started.elapsed());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_render_as_lines() {
        let download = ClientCommand::Download {
            uri: "coaps://127.0.0.1:5684/".into(),
            dest: PathBuf::from("/tmp/out"),
            psk: Some(("Help".into(), "ImTrappedInAUniverseFactory".into())),
        };
        assert_eq!(
            download.to_string(),
            "download coaps://127.0.0.1:5684/ /tmp/out Help ImTrappedInAUniverseFactory"
        );
        assert_eq!(ClientCommand::Reconnect(Transport::Udp).to_string(), "reconnect udp");
        assert_eq!(ClientCommand::EnterOffline(Transport::Udp).to_string(), "enter-offline udp");
        assert_eq!(ClientCommand::RemoveServer.to_string(), "remove-server");
    }

    #[test]
    fn commands_parse_back() {
        for line in [
            "download coap://127.0.0.1:5683/test /tmp/out",
            "download coaps://[::1]:5684/ /tmp/out id key",
            "reconnect udp",
            "enter-offline tcp",
            "exit-offline udp",
            "remove-server",
        ] {
            let command: ClientCommand = line.parse().unwrap();
            assert_eq!(command.to_string(), line);
        }
    }

    #[test]
    fn malformed_commands_are_rejected() {
        for line in ["", "download onlyuri", "download a b c", "reconnect", "reconnect sctp", "remove-server now"] {
            assert!(line.parse::<ClientCommand>().is_err(), "{line:?} parsed");
        }
    }

    #[test]
    fn transport_parse_ignores_case() {
        assert_eq!("UDP".parse::<Transport>().unwrap(), Transport::Udp);
    }

    #[test]
    fn rebind_check() {
        let old = ConnectionHandle::from("127.0.0.1:40000".parse::<std::net::SocketAddr>().unwrap());
        let new = ConnectionHandle::from("127.0.0.1:40001".parse::<std::net::SocketAddr>().unwrap());
        assert_eq!(ensure_rebound(old, new).unwrap(), new);
        assert!(matches!(ensure_rebound(old, old), Err(HarnessError::UnchangedRemote(_))));
    }
}
