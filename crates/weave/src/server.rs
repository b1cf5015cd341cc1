//! HTTP/websocket server for the live page.
//!
//! `GET /` serves the current document rendered into the page template;
//! `GET /ws` upgrades to a websocket that receives every broadcast event
//! and accepts client requests (reevaluate, restart_kernel, ping).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{Html, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use log::{error, info};
use tokio::sync::{broadcast, mpsc};
use weave_doc::{report, Document};

use crate::coordinator::Event;
use crate::protocol::ClientRequest;

#[derive(Clone)]
pub struct AppState {
    pub doc: Arc<StdMutex<Document>>,
    pub events: mpsc::Sender<Event>,
    pub broadcast: broadcast::Sender<String>,
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_upgrade))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("[server] Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index(State(state): State<AppState>) -> Html<String> {
    let cells_html = state.doc.lock().unwrap().full_html();
    Html(report::page(&cells_html))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("[server] Client connected");
    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.broadcast.subscribe();

    // Forward broadcasts to this client until it goes away.
    let send_task = tokio::spawn(async move {
        while let Ok(text) = events_rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        match serde_json::from_str::<ClientRequest>(&text) {
            Ok(request) => {
                if state.events.send(Event::Client(request)).await.is_err() {
                    break;
                }
            }
            // Protocol error scoped to this one message; the connection
            // and the rest of the document keep going.
            Err(e) => error!("[server] Unknown client message: {}", e),
        }
    }

    send_task.abort();
    info!("[server] Client disconnected");
}
