//! Minimal HTTP/1.1 control and streaming surface.
//!
//! Every connection gets its own thread: stream viewers hold theirs for as
//! long as they watch, and `start_detection` blocks while models load.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::control::{self, ControlResponse, RECENT_ACCESS_EVENTS, RECENT_NOTIFICATIONS};
use crate::metrics;
use crate::mjpeg;
use crate::orchestrator::Orchestrator;
use crate::store::{EventStore, RegistryStore};

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stops accepting connections and ends open streams.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("http server thread panicked"))?;
        }
        Ok(())
    }

    /// Blocks until the accept loop exits.
    pub fn wait(mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("http server thread panicked"))?;
        }
        Ok(())
    }
}

struct Shared {
    orchestrator: Arc<Orchestrator>,
    events: Arc<dyn EventStore>,
    registry: Arc<dyn RegistryStore>,
    stream_fps: u32,
    shutdown: Arc<AtomicBool>,
}

pub struct HttpServer {
    addr: String,
    orchestrator: Arc<Orchestrator>,
    events: Arc<dyn EventStore>,
    registry: Arc<dyn RegistryStore>,
    stream_fps: u32,
}

impl HttpServer {
    pub fn new(
        addr: impl Into<String>,
        orchestrator: Arc<Orchestrator>,
        events: Arc<dyn EventStore>,
        registry: Arc<dyn RegistryStore>,
        stream_fps: u32,
    ) -> Self {
        Self {
            addr: addr.into(),
            orchestrator,
            events,
            registry,
            stream_fps,
        }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(&self.addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Shared {
            orchestrator: self.orchestrator,
            events: self.events,
            registry: self.registry,
            stream_fps: self.stream_fps,
            shutdown: shutdown.clone(),
        });
        let join = thread::Builder::new()
            .name("http".to_string())
            .spawn(move || {
                if let Err(err) = accept_loop(listener, shared) {
                    error!("http server stopped: {err:#}");
                }
            })?;
        info!(%addr, "http server listening");

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) -> Result<()> {
    while !shared.shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let shared = shared.clone();
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &shared) {
                        warn!(%peer, "request failed: {err:#}");
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text.lines().next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = raw_path.split_once('?').unwrap_or((raw_path, ""));
    let query = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
    })
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

fn write_json<T: Serialize>(stream: &mut TcpStream, status: u16, body: &T) -> Result<()> {
    write_response(stream, status, "application/json", &serde_json::to_vec(body)?)
}

fn limit(request: &HttpRequest, key: &str, default: usize) -> Result<usize> {
    match request.query.get(key) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| anyhow!("{key} must be a non negative integer")),
    }
}

fn handle_connection(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    debug!(method = %request.method, path = %request.path, "request");

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/video_feed") => stream_video(stream, shared),
        ("POST", "/start_detection") => match shared.orchestrator.start() {
            Ok(status) => write_json(&mut stream, 200, &ControlResponse::from(status)),
            Err(err) => write_json(
                &mut stream,
                500,
                &json!({"status": "error", "message": format!("{err:#}")}),
            ),
        },
        ("POST", "/stop_detection") => {
            let status = shared.orchestrator.stop();
            write_json(&mut stream, 200, &ControlResponse::from(status))
        }
        ("GET", "/get_logs") => {
            let (access, notifications) = match (
                limit(&request, "access", RECENT_ACCESS_EVENTS),
                limit(&request, "notifications", RECENT_NOTIFICATIONS),
            ) {
                (Ok(access), Ok(notifications)) => (access, notifications),
                (Err(err), _) | (_, Err(err)) => {
                    return write_json(&mut stream, 400, &json!({"error": err.to_string()}));
                }
            };
            match control::recent_events(shared.events.as_ref(), access, notifications) {
                Ok(recent) => write_json(&mut stream, 200, &recent),
                Err(err) => write_json(&mut stream, 500, &json!({"error": err.to_string()})),
            }
        }
        ("GET", "/users") => match control::list_users(shared.registry.as_ref()) {
            Ok(users) => write_json(&mut stream, 200, &users),
            Err(err) => write_json(&mut stream, 500, &json!({"error": err.to_string()})),
        },
        ("GET", "/health") => write_json(
            &mut stream,
            200,
            &json!({"status": "ok", "pipeline": shared.orchestrator.state()}),
        ),
        ("GET", "/metrics") => {
            let text = metrics::render()?;
            write_response(&mut stream, 200, "text/plain; version=0.0.4", text.as_bytes())
        }
        (
            _,
            "/video_feed" | "/start_detection" | "/stop_detection" | "/get_logs" | "/users"
            | "/health" | "/metrics",
        ) => write_json(&mut stream, 405, &json!({"error": "method_not_allowed"})),
        _ => write_json(&mut stream, 404, &json!({"error": "not_found"})),
    }
}

fn stream_video(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        mjpeg::CONTENT_TYPE
    );
    stream.write_all(header.as_bytes())?;
    let frames = shared.orchestrator.frames();
    match mjpeg::stream_to(&frames, &mut stream, shared.stream_fps, &shared.shutdown) {
        Ok(parts) => debug!(parts, "stream closed by server"),
        Err(err) => debug!("stream viewer left: {err}"),
    }
    Ok(())
}
