use crate::router;
use ether_core::ipc::{self, EtherReply, EtherRequest};
use ether_core::{EtherError, SqliteEther};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_util::codec::Framed;

pub async fn run_proxy_server(
    listen_addr: &str,
    ether: SqliteEther,
    shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    serve(listener, ether, shutdown).await
}

/// Accept clients on `listener` until `shutdown` fires.
///
/// Each connection is a request/reply loop. Requests from all connections are dispatched
/// one at a time against the store.
pub async fn serve(
    listener: TcpListener,
    ether: SqliteEther,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    tracing::info!("Ether proxy listening on {}", listener.local_addr()?);
    let ether = Arc::new(Mutex::new(ether));

    loop {
        tokio::select! {
            res = listener.accept() => {
                let (stream, peer) = res?;
                tracing::debug!("Proxy client connected from {}", peer);
                let ether = Arc::clone(&ether);
                let conn_shutdown = shutdown.resubscribe();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ether, conn_shutdown).await {
                        tracing::error!("Proxy connection {} failed: {}", peer, e);
                    }
                    tracing::debug!("Proxy client {} disconnected", peer);
                });
            }
            _ = shutdown.recv() => {
                tracing::info!("Shutting down ether proxy...");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    ether: Arc<Mutex<SqliteEther>>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(stream, ipc::frame_codec());

    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = shutdown.recv() => break,
        };
        let bytes = match frame {
            Some(Ok(b)) => b,
            Some(Err(e)) => {
                tracing::error!("Frame error: {}", e);
                break;
            }
            None => break,
        };

        let reply = match ipc::decode::<EtherRequest>(&bytes) {
            Ok(request) => {
                let ether = ether.lock().await;
                router::handle_request(request, &ether).await
            }
            Err(e) => {
                tracing::warn!("Ignoring malformed request: {}", e);
                EtherReply::fault(&EtherError::transport(format!("malformed request: {}", e)))
            }
        };

        let resp_bytes = match ipc::encode(&reply) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Failed to serialize reply: {}", e);
                break;
            }
        };
        if let Err(e) = framed.send(resp_bytes).await {
            tracing::error!("Failed to send reply: {}", e);
            break;
        }
    }

    Ok(())
}
