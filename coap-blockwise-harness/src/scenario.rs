//! The download conformance cases.
//!
//! Each case gets a fresh endpoint, store and history, talks to the client
//! only through [`ClientControl`], and releases its endpoint before
//! returning, whether or not the body failed.
//!
//! | case                                      | server side                      |
//! |-------------------------------------------|----------------------------------|
//! | [`download_sockets`]                      | file server, socket accounting   |
//! | [`download_does_not_block_control_traffic`] | file server + control endpoint |
//! | [`download_ignores_unrelated_requests`]   | file server sends stray GETs     |
//! | [`download_over_secure_transport`]        | PSK file server                  |
//! | [`download_with_retransmissions`]         | file server, [`ModuloBackoff`]   |
//! | [`download_reconnect`]                    | [`LifecycleController`]          |
//! | [`download_offline`]                      | [`LifecycleController`]          |

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use rand::Rng;

use crate::config::HarnessConfig;
use crate::endpoint::{Security, TransportEndpoint};
use crate::error::{HarnessError, Result};
use crate::gate::{AlwaysAnswer, ModuloBackoff, RetransmissionGate};
use crate::lifecycle::{
    verify_control_traffic, verify_download, wait_for_socket_count, ClientCommand, ClientControl,
    LifecycleController, Transport,
};
use crate::message::Message;
use crate::server::{FileServer, FileServerHandle, FileServerStats};
use crate::timer;

pub const DUMMY_PAYLOAD_LEN: usize = 16 * 1024;

pub const PSK_IDENTITY: &[u8] = b"Help";
pub const PSK_KEY: &[u8] = b"ImTrappedInAUniverseFactory";

/// Fresh random payload of [`DUMMY_PAYLOAD_LEN`] bytes.
pub fn dummy_payload() -> Vec<u8> {
    let mut payload = vec![0u8; DUMMY_PAYLOAD_LEN];
    rand::rng().fill(&mut payload[..]);
    payload
}

fn loopback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

async fn start_file_server(
    security: Security,
    gate: Arc<dyn RetransmissionGate>,
    config: &HarnessConfig,
) -> Result<FileServerHandle> {
    let server = FileServer::bind(loopback(), security, gate, config.clone()).await?;
    Ok(server.run())
}

/// Stop `server`, then report the body's failure first.
async fn teardown(server: FileServerHandle, outcome: Result<()>) -> Result<FileServerStats> {
    let stopped = server.shutdown().await;
    outcome?;
    stopped
}

/// Register `payload` at `/` and start the client's download.  Returns the
/// client's socket count from before the command.
async fn download_from<C: ClientControl>(
    client: &mut C,
    server: &FileServerHandle,
    payload: &[u8],
    dest: &Path,
    psk: Option<(String, String)>,
) -> Result<usize> {
    let baseline = client.socket_count().await?;
    let uri = server.store().register("/", payload.to_vec());
    client
        .communicate(ClientCommand::Download {
            uri,
            dest: dest.to_path_buf(),
            psk,
        })
        .await?;
    Ok(baseline)
}

async fn wait_until_downloads_finished<C: ClientControl>(
    client: &C,
    baseline: usize,
    config: &HarnessConfig,
) -> Result<()> {
    wait_for_socket_count(client, baseline, config.completion_timeout, config.poll_interval).await
}

/// The download opens exactly one extra socket, over UDP, and closes it
/// when done.
pub async fn download_sockets<C: ClientControl>(
    client: &mut C,
    dest: &Path,
    config: &HarnessConfig,
) -> Result<()> {
    let server = start_file_server(Security::NoSec, Arc::new(AlwaysAnswer), config).await?;
    let payload = dummy_payload();
    let outcome = async {
        let baseline = download_from(client, &server, &payload, dest, None).await?;
        wait_for_socket_count(
            client,
            baseline + 1,
            config.socket_count_timeout * 2,
            config.poll_interval,
        )
        .await?;
        let transport = client.socket_transport(baseline).await?;
        if transport != Transport::Udp {
            return Err(HarnessError::Client(format!(
                "download socket uses {transport}, expected udp"
            )));
        }
        wait_until_downloads_finished(client, baseline, config).await?;
        verify_download(dest, &payload).await
    }
    .await;
    teardown(server, outcome).await.map(drop)
}

/// Control requests keep being answered promptly while a download runs.
///
/// `control` is the endpoint the client's control socket talks to.
pub async fn download_does_not_block_control_traffic<C: ClientControl>(
    client: &mut C,
    control: &mut TransportEndpoint,
    dest: &Path,
    config: &HarnessConfig,
) -> Result<()> {
    let server = start_file_server(Security::NoSec, Arc::new(AlwaysAnswer), config).await?;
    let payload = dummy_payload();
    let outcome = async {
        let baseline = download_from(client, &server, &payload, dest, None).await?;
        verify_control_traffic(control, config).await?;
        wait_until_downloads_finished(client, baseline, config).await?;
        verify_download(dest, &payload).await
    }
    .await;
    teardown(server, outcome).await.map(drop)
}

/// Requests sent by the server to the client's download socket do not
/// disturb the transfer.
pub async fn download_ignores_unrelated_requests<C: ClientControl>(
    client: &mut C,
    dest: &Path,
    config: &HarnessConfig,
) -> Result<()> {
    let server = start_file_server(Security::NoSec, Arc::new(AlwaysAnswer), config).await?;
    let payload = dummy_payload();
    let outcome = async {
        let baseline = download_from(client, &server, &payload, dest, None).await?;
        wait_for_socket_count(
            client,
            baseline + 1,
            config.socket_count_timeout,
            config.poll_interval,
        )
        .await?;

        let history = server.history().clone();
        timer::wait_until(
            config.receive_timeout,
            config.poll_interval,
            "first download request",
            || {
                let history = history.clone();
                async move { !history.is_empty() }
            },
        )
        .await?;

        for stray in stray_requests(10) {
            server.send_to_peer(stray).await?;
        }

        wait_until_downloads_finished(client, baseline, config).await?;
        verify_download(dest, &payload).await
    }
    .await;
    teardown(server, outcome).await.map(drop)
}

fn stray_requests(count: usize) -> Vec<Message> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| {
            let mut stray = Message::get("/3/0/2").with_token(rng.random::<[u8; 4]>().to_vec());
            stray.message_id = rng.random();
            stray
        })
        .collect()
}

/// The same download from a PSK-secured endpoint, credentials passed with
/// the download command.
pub async fn download_over_secure_transport<C: ClientControl>(
    client: &mut C,
    dest: &Path,
    config: &HarnessConfig,
) -> Result<()> {
    let security = Security::psk(PSK_IDENTITY, PSK_KEY);
    let server = start_file_server(security, Arc::new(AlwaysAnswer), config).await?;
    let payload = dummy_payload();
    let psk = Some((
        String::from_utf8_lossy(PSK_IDENTITY).into_owned(),
        String::from_utf8_lossy(PSK_KEY).into_owned(),
    ));
    let outcome = async {
        let baseline = download_from(client, &server, &payload, dest, psk).await?;
        wait_until_downloads_finished(client, baseline, config).await?;
        verify_download(dest, &payload).await
    }
    .await;
    teardown(server, outcome).await.map(drop)
}

/// Block `n` is ignored `n % 4` times before being answered; the client
/// must retransmit its way through.
pub async fn download_with_retransmissions<C: ClientControl>(
    client: &mut C,
    dest: &Path,
    config: &HarnessConfig,
) -> Result<()> {
    let gate = ModuloBackoff::default();
    let server = start_file_server(Security::NoSec, Arc::new(gate), config).await?;
    let payload = dummy_payload();
    let outcome = async {
        let baseline = download_from(client, &server, &payload, dest, None).await?;
        wait_until_downloads_finished(client, baseline, config).await?;
        verify_download(dest, &payload).await
    }
    .await;
    let stats = teardown(server, outcome).await?;

    let blocks = payload.len().div_ceil(config.block_size).max(1) as u32;
    let expected = gate.total_drops(blocks);
    if stats.dropped != expected {
        return Err(HarnessError::mismatch(format!(
            "expected {expected} dropped requests, server dropped {}",
            stats.dropped
        )));
    }
    log::info!("[scenario] {blocks} blocks, {expected} forced retransmissions");
    Ok(())
}

/// Mid-transfer the connection is reset and the client told to reconnect;
/// it must come back from a new port and resume where it stopped.
pub async fn download_reconnect<C: ClientControl>(
    client: &mut C,
    dest: &Path,
    config: &HarnessConfig,
) -> Result<()> {
    client.communicate(ClientCommand::RemoveServer).await?;
    let endpoint = TransportEndpoint::bind(loopback(), Security::NoSec).await?;
    let mut controller = LifecycleController::new(endpoint, client, config.clone());

    let payload = dummy_payload();
    let mut ctx = controller
        .download_context("/test", payload.clone(), dest)
        .await?;
    controller.transfer_data(&mut ctx, payload.len() / 2).await?;
    controller.expect_request(&ctx).await?;
    controller.reconnect().await?;
    controller.transfer_data(&mut ctx, payload.len()).await?;
    controller.finish(ctx).await
}

/// Mid-transfer the client goes offline: nothing may arrive during the
/// offline window.  Back online, it must reconnect from a new port and
/// resume.
pub async fn download_offline<C: ClientControl>(
    client: &mut C,
    dest: &Path,
    config: &HarnessConfig,
) -> Result<()> {
    client.communicate(ClientCommand::RemoveServer).await?;
    let endpoint = TransportEndpoint::bind(loopback(), Security::NoSec).await?;
    let mut controller = LifecycleController::new(endpoint, client, config.clone());

    let payload = dummy_payload();
    let mut ctx = controller
        .download_context("/test", payload.clone(), dest)
        .await?;
    controller.transfer_data(&mut ctx, payload.len() / 2).await?;
    controller.expect_request(&ctx).await?;
    controller.offline_then_online().await?;
    controller.transfer_data(&mut ctx, payload.len()).await?;
    controller.finish(ctx).await
}
