// WebSocket server for auction clients.
//
// Each accepted connection gets its own task and its own `Session`. The task
// multiplexes two inputs: frames from the client, which are dispatched to the
// engine, and committed snapshots from the store, which are forwarded when
// they belong to the auction the connection follows.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use gavel_core::engine::AuctionEngine;
use gavel_core::model::AuctionSnapshot;

use crate::protocol::ServerMessage;
use crate::session::Session;

/// Source of raw client connections.
#[async_trait]
pub trait WsListener: Send {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> anyhow::Result<(Self::Conn, SocketAddr)>;

    fn local_addr(&self) -> anyhow::Result<SocketAddr>;
}

/// TCP listener whose connections are upgraded with tokio-tungstenite.
pub struct TungsteniteListener {
    inner: TcpListener,
}

impl TungsteniteListener {
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(TungsteniteListener { inner })
    }
}

#[async_trait]
impl WsListener for TungsteniteListener {
    type Conn = TcpStream;

    async fn accept(&mut self) -> anyhow::Result<(TcpStream, SocketAddr)> {
        Ok(self.inner.accept().await?)
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

/// Accept connections until `shutdown` flips, serving each on its own task.
pub async fn run<L: WsListener>(
    mut listener: L,
    engine: AuctionEngine,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!("WebSocket server listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (conn, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };
                let engine = engine.clone();
                tokio::spawn(async move {
                    serve_connection(conn, addr, engine).await;
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("WebSocket server stopped");
    Ok(())
}

async fn serve_connection<C>(conn: C, addr: SocketAddr, engine: AuctionEngine)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let ws_stream = match tokio_tungstenite::accept_async(conn).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {addr}: {e}");
            return;
        }
    };
    info!("Client connected from {addr}");

    let updates = engine.store().subscribe();
    let (write, read) = ws_stream.split();
    let session = Session::new(engine);
    if let Err(e) = process_connection(read, write, session, updates, &addr.to_string()).await {
        debug!("Connection {addr} closed with error: {e}");
    }
    info!("Client {addr} disconnected");
}

/// Drive one connection to completion.
///
/// Generic over the stream and sink so it can be tested with in-memory
/// streams without opening TCP ports. Returns when the client closes, the
/// inbound stream ends or errors, or a write fails.
pub async fn process_connection<St, Si>(
    mut inbound: St,
    mut outbound: Si,
    mut session: Session,
    mut updates: broadcast::Receiver<Arc<AuctionSnapshot>>,
    addr: &str,
) -> Result<(), String>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut updates_open = true;
    // Newest snapshot pushed so far, as (auction id, version).
    let mut newest: Option<(String, i64)> = None;

    loop {
        tokio::select! {
            frame = inbound.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        for reply in session.handle_text(&text) {
                            send(&mut outbound, &reply).await?;
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {addr} sent close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ignore Binary, Ping, Pong, Frame variants.
                    }
                    None => break,
                }
            }
            update = updates.recv(), if updates_open => {
                match update {
                    Ok(snapshot) => {
                        if session.follows(snapshot.auction_id())
                            && is_newer(&newest, &snapshot)
                        {
                            newest = Some((snapshot.auction_id().to_string(), snapshot.version));
                            send(&mut outbound, &session.snapshot_message(&snapshot)).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Connection {addr} lagged {skipped} updates; resyncing");
                        if let Some(latest) = session.current_snapshot() {
                            if let ServerMessage::Snapshot { auction, .. } = &latest {
                                newest = Some((auction.auction_id().to_string(), auction.version));
                            }
                            send(&mut outbound, &latest).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        updates_open = false;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Whether `snapshot` supersedes what this connection last received.
fn is_newer(newest: &Option<(String, i64)>, snapshot: &AuctionSnapshot) -> bool {
    match newest {
        Some((auction_id, version)) if auction_id == snapshot.auction_id() => {
            snapshot.version > *version
        }
        _ => true,
    }
}

async fn send<Si>(outbound: &mut Si, msg: &ServerMessage) -> Result<(), String>
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    outbound
        .send(Message::Text(msg.to_json().into()))
        .await
        .map_err(|e| e.to_string())
}
