//! WebSocket server: `/` streams transactions, `/stats` streams stats.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use tilefeed_core::FeedError;

use crate::delivery::run_delivery;
use crate::hub::Hub;
use crate::message::{ClientAction, ClientMessage, ServerMessage};
use crate::stats::StatsPublisher;
use crate::subscriber::{Subscriber, SubscriberSink, TileView};

/// Shared state of the routes.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub stats: Arc<StatsPublisher>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(transactions_ws))
        .route("/stats", get(stats_ws))
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), FeedError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| FeedError::Config(format!("cannot bind {addr}: {e}")))?;
    info!(%addr, "live server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| FeedError::Other(e.to_string()))
}

// ─── Transactions channel ─────────────────────────────────────────────────────

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl SubscriberSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), FeedError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|e| FeedError::Other(e.to_string()))
    }
}

async fn transactions_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_transactions(socket, state.hub))
}

async fn handle_transactions(socket: WebSocket, hub: Arc<Hub>) {
    let (sink, mut stream) = socket.split();
    let sub = hub.register();
    let id = sub.id();
    let delivery = tokio::spawn(run_delivery(hub.clone(), sub.clone(), WsSink(sink)));

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_control(&sub, &text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(subscriber = id, error = %e, "websocket read failed");
                break;
            }
        }
        if sub.is_closed() {
            break;
        }
    }

    hub.unregister(id);
    if let Ok(Err(e)) = delivery.await {
        debug!(subscriber = id, error = %e, "delivery ended with error");
    }
}

/// Apply a `{action, layer, tileRange}` control message.
fn handle_control(sub: &Subscriber, text: &str) {
    if text.trim().eq_ignore_ascii_case("ping") {
        return;
    }
    let msg: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            sub.notify(ServerMessage::Error(format!("invalid control message: {e}")));
            return;
        }
    };
    match msg.action {
        ClientAction::Reset => sub.set_view(None),
        ClientAction::View => {
            let bounds = msg
                .tile_range
                .as_ref()
                .and_then(|(lo, hi)| Some((lo.value()?, hi.value()?)));
            match bounds {
                Some((lo, hi)) => sub.set_view(Some(TileView::new(msg.layer, lo, hi))),
                None => sub.notify(ServerMessage::Error("view requires a tileRange [lo, hi]".into())),
            }
        }
    }
}

// ─── Stats channel ────────────────────────────────────────────────────────────

async fn stats_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stats(socket, state.stats))
}

async fn handle_stats(socket: WebSocket, stats: Arc<StatsPublisher>) {
    let (mut sink, mut stream) = socket.split();
    let mut rx = stats.subscribe();

    // First frame right away, then every interval.
    match stats.frame().await {
        Ok(frame) => {
            if sink.send(Message::Text(frame)).await.is_err() {
                return;
            }
        }
        Err(e) => warn!(error = %e, "initial stats snapshot failed"),
    }

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(frame) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => debug!(skipped = n, "stats subscriber lagged"),
                Err(RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("stats subscriber left");
}
