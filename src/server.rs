//! Dev server: static file serving plus live-reload fan-out.
//!
//! 1. **HTTP server**: serves the generated output directory on a dedicated
//!    thread with its own single-threaded runtime.
//! 2. **Websocket fan-out**: one thread accepts browser connections, another
//!    broadcasts a `"reload"` message to every open tab whenever the graph
//!    emits [`Event::Rerun`]. Pages are expected to embed a small script
//!    connecting to the websocket port and refreshing on that message.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use axum::Router;
use camino::Utf8PathBuf;
use console::style;
use tokio::sync::broadcast::error::RecvError;
use tower_http::services::ServeDir;
use tungstenite::WebSocket;

use crate::graph::{Event, Graph};

/// Maximum number of websocket connections kept around; the oldest beyond
/// this are closed on every reload.
const MAX_CLIENTS: usize = 10;

/// Starts the live-reload fan-out and returns the websocket port.
///
/// Must be called within a tokio runtime: a background task forwards the
/// graph's [`Event::Rerun`] notifications to the broadcast thread.
pub fn spawn_reload(graph: &Graph) -> std::io::Result<u16> {
    let (listener, port) = reserve_port()?;
    let clients = Arc::new(Mutex::new(Vec::new()));

    let _incoming = new_thread_ws_incoming(listener, clients.clone());
    let (tx_reload, _outgoing) = new_thread_ws_reload(clients);

    let mut events = graph.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(Event::Rerun) => {
                    if tx_reload.send(()).is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    Ok(port)
}

/// Serves `dist` over HTTP on a background thread.
pub fn serve_dist(dist: impl Into<Utf8PathBuf>, port: u16) -> JoinHandle<anyhow::Result<()>> {
    let dist = dist.into();
    let url = style(format!("http://localhost:{port}/")).yellow();
    eprintln!("Serving {dist} on {url}");

    std::thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(serve(dist, port))
    })
}

async fn serve(dist: Utf8PathBuf, port: u16) -> anyhow::Result<()> {
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(address).await?;

    let router = Router::new().fallback_service(ServeDir::new(dist.as_std_path()));
    axum::serve(listener, router).await?;

    Ok(())
}

/// Binds the websocket listener, preferring the fixed port 1337 so the
/// client script works out of the box.
fn reserve_port() -> std::io::Result<(TcpListener, u16)> {
    let listener = match TcpListener::bind("127.0.0.1:1337") {
        Ok(sock) => sock,
        Err(_) => TcpListener::bind("127.0.0.1:0")?,
    };

    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

fn new_thread_ws_incoming(
    server: TcpListener,
    clients: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for stream in server.incoming() {
            let Ok(stream) = stream else { continue };

            match tungstenite::accept(stream) {
                Ok(socket) => clients.lock().unwrap().push(socket),
                Err(e) => tracing::error!("websocket handshake failed: {e}"),
            }
        }
    })
}

fn new_thread_ws_reload(
    clients: Arc<Mutex<Vec<WebSocket<TcpStream>>>>,
) -> (Sender<()>, JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();

    let thread = std::thread::spawn(move || {
        while rx.recv().is_ok() {
            let mut clients = clients.lock().unwrap();

            clients.retain_mut(|socket| match socket.send("reload".into()) {
                Ok(_) => true,
                Err(tungstenite::error::Error::Io(e))
                    if e.kind() == std::io::ErrorKind::BrokenPipe =>
                {
                    false
                }
                Err(e) => {
                    tracing::error!("websocket send failed: {e}");
                    true
                }
            });

            let len = clients.len();
            if len > MAX_CLIENTS {
                for mut socket in clients.drain(0..len - MAX_CLIENTS) {
                    socket.close(None).ok();
                }
            }
        }
    });

    (tx, thread)
}
