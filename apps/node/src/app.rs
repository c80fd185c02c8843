//! Wires configuration, the data channel and the transfer engine together.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use syndro_data_channel::{TcpDataServer, TcpPeerClient};
use syndro_parallel::{
    ApprovalMode, ParallelReceiver, ParallelSender, PeerTransport, ReceiverConfig, SendRequest,
    SenderConfig, StaticKeys, TransferEvent,
};
use syndro_protocol::DeviceDescriptor;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::progress;

/// Options for `syndro-node receive`.
#[derive(Debug, Default)]
pub struct ReceiveOptions {
    pub dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub manual: bool,
}

/// Options for `syndro-node send`.
#[derive(Debug)]
pub struct SendOptions {
    pub file: PathBuf,
    pub peer: SocketAddr,
    pub token: Option<String>,
    pub connections: Option<u32>,
    pub chunk_size: Option<u32>,
}

fn key_provider(config: &Config) -> anyhow::Result<StaticKeys> {
    Ok(match config.secret_key()? {
        Some(key) => StaticKeys::with_fallback(key),
        None => StaticKeys::new(),
    })
}

/// Runs a receiving node until Ctrl-C.
pub async fn receive(config: Config, opts: ReceiveOptions) -> anyhow::Result<()> {
    let mut receiver_config =
        ReceiverConfig::new(opts.dir.unwrap_or_else(|| config.download_dir.clone()));
    receiver_config.approval = if opts.manual {
        ApprovalMode::Manual
    } else {
        config.approval
    };
    receiver_config.collision = config.collision;

    tokio::fs::create_dir_all(&receiver_config.download_dir)
        .await
        .with_context(|| {
            format!(
                "creating download directory {}",
                receiver_config.download_dir.display()
            )
        })?;

    let approval = receiver_config.approval;
    let receiver = Arc::new(ParallelReceiver::new(
        receiver_config,
        Arc::new(key_provider(&config)?),
    ));

    let cancel = CancellationToken::new();
    let server = Arc::new(TcpDataServer::new(
        Arc::clone(&receiver),
        config.token.clone(),
        cancel.clone(),
    ));
    let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, opts.port.unwrap_or(config.port)));
    let (info, listener) = server.listen(bind).await?;

    tracing::info!(
        port = info.port,
        dir = %receiver.config().download_dir.display(),
        "receiving; peers connect with this node's token"
    );

    tokio::spawn(progress::print_events(receiver.events().subscribe(), false));
    if approval == ApprovalMode::Manual {
        tokio::spawn(prompt_approvals(Arc::clone(&receiver)));
    }

    let serve = tokio::spawn(Arc::clone(&server).serve(listener));

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");

    cancel.cancel();
    receiver.dispose().await;
    serve.await??;

    tracing::info!("receiver shut down cleanly");
    Ok(())
}

/// Asks on stdin whether to accept each transfer awaiting approval.
async fn prompt_approvals(receiver: Arc<ParallelReceiver>) {
    let mut events = receiver.events().subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(event) = events.recv().await {
        let TransferEvent::AwaitingApproval {
            transfer_id,
            request_id,
        } = event
        else {
            continue;
        };

        if let Some(session) = receiver.session(&transfer_id) {
            eprintln!(
                "\n{} wants to send {} ({}). Accept? [y/N]",
                session.sender_name,
                session.file_name,
                progress::format_bytes(session.file_size)
            );
        }

        let accepted = matches!(
            lines.next_line().await,
            Ok(Some(answer)) if answer.trim().eq_ignore_ascii_case("y")
        );
        let result = if accepted {
            receiver.approve(&request_id).await
        } else {
            receiver.reject(&request_id).await
        };
        if let Err(e) = result {
            tracing::warn!(%request_id, error = %e, "approval not applied");
        }
    }
}

/// Descriptor for a peer given on the command line instead of by discovery.
fn peer_device(addr: SocketAddr) -> DeviceDescriptor {
    DeviceDescriptor {
        id: addr.to_string(),
        name: addr.to_string(),
        address: addr.ip().to_string(),
        port: addr.port(),
    }
}

/// Sends one file and waits for the receiver's verdict.
pub async fn send(config: Config, opts: SendOptions) -> anyhow::Result<()> {
    let mut sender_config = SenderConfig::new(&config.device_id, &config.name);
    sender_config.parallel = config.parallel;
    if let Some(connections) = opts.connections {
        sender_config.parallel.connections = connections;
    }
    if let Some(chunk_size) = opts.chunk_size {
        sender_config.parallel.chunk_size = chunk_size;
    }

    let token = opts.token.unwrap_or_else(|| config.token.clone());
    let device = peer_device(opts.peer);
    let clients = (0..sender_config.parallel.connections.max(1))
        .map(|_| {
            TcpPeerClient::for_device(&device, token.clone())
                .map(|client| Arc::new(client) as Arc<dyn PeerTransport>)
        })
        .collect::<Result<Vec<_>, _>>()?;
    tracing::info!(peer = %device.name, lanes = clients.len(), "sending");

    let sender = Arc::new(ParallelSender::new(sender_config, clients)?);

    let mut request = SendRequest::new(&opts.file);
    if let Some(key) = config.secret_key()? {
        request = request.with_key(key);
    }
    let transfer_id = request.transfer_id.clone();

    let printer = tokio::spawn(progress::print_events(sender.events().subscribe(), true));

    let canceller = {
        let sender = Arc::clone(&sender);
        let transfer_id = transfer_id.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(%transfer_id, "SIGINT received, cancelling");
                sender.cancel(&transfer_id);
            }
        })
    };

    let result = sender.send(request).await;
    canceller.abort();
    // A request rejected before registration emits no terminal event.
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    sender.dispose();

    let outcome = result?;
    tracing::info!(
        transfer_id = %outcome.transfer_id,
        hash = %outcome.file_hash,
        saved = outcome.saved_path.as_deref().unwrap_or("unconfirmed"),
        "transfer finished"
    );
    if !outcome.receiver_confirmed {
        tracing::warn!("receiver did not confirm the save");
    }
    Ok(())
}
