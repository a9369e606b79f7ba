//! Actix Web preview server exposing the latest JPEG, an MJPEG stream,
//! printer status and Prometheus metrics.
//!
//! The server runs on its own thread with its own actix `System` so the
//! supervisory loop never touches an async runtime.

use std::{io, net::SocketAddr, thread::JoinHandle, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result, anyhow};
use crossbeam_channel::bounded;
use async_stream::stream;
use tokio::sync::oneshot;
use tracing::error;

use crate::monitor::{
    data::{PreviewPacket, SharedPacket},
    telemetry::{prometheus_handle, spawn_thread},
};

const STREAM_INTERVAL: Duration = Duration::from_millis(66);

struct ServerState {
    latest: SharedPacket,
}

/// Handle for the preview server thread.
pub(crate) struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl PreviewServer {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Start the server thread and wait for its listener, so a taken or
/// forbidden address fails the caller instead of only the thread.
pub(crate) fn spawn_preview_server(addr: SocketAddr, shared: SharedPacket) -> Result<PreviewServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (bound_tx, bound_rx) = bounded::<io::Result<SocketAddr>>(1);
    let handle = spawn_thread("printwatch-preview-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let bound = HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(ServerState {
                        latest: shared.clone(),
                    }))
                    .route("/frame.jpg", web::get().to(frame_handler))
                    .route("/stream.mjpg", web::get().to(stream_handler))
                    .route("/status", web::get().to(status_handler))
                    .route("/metrics", web::get().to(metrics_handler))
            })
            .workers(1)
            .bind(addr);
            let server = match bound {
                Ok(server) => server,
                Err(err) => {
                    let _ = bound_tx.send(Err(err));
                    return Ok(());
                }
            };
            let local_addr = server.addrs().first().copied().unwrap_or(addr);
            let server = server.run();
            let _ = bound_tx.send(Ok(local_addr));

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn preview server thread")?;

    match bound_rx.recv() {
        Ok(Ok(local_addr)) => Ok(PreviewServer {
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
            local_addr,
        }),
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(err).with_context(|| format!("Failed to bind preview server on {addr}"))
        }
        Err(_) => {
            let _ = handle.join();
            Err(anyhow!("Preview server thread exited before binding {addr}"))
        }
    }
}

fn latest_packet(shared: &SharedPacket) -> Option<PreviewPacket> {
    shared.lock().ok().and_then(|guard| guard.clone())
}

async fn frame_handler(state: web::Data<ServerState>) -> HttpResponse {
    match latest_packet(&state.latest) {
        Some(packet) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .body(packet.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn status_handler(state: web::Data<ServerState>) -> HttpResponse {
    match latest_packet(&state.latest) {
        Some(packet) => HttpResponse::Ok().json(packet.metadata),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn metrics_handler() -> HttpResponse {
    match prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().finish(),
    }
}

/// Multipart MJPEG; a part is emitted only when a new frame has arrived.
async fn stream_handler(state: web::Data<ServerState>) -> HttpResponse {
    let state = state.clone();
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(STREAM_INTERVAL);
        let mut last_sent = None;
        loop {
            interval.tick().await;
            let Some(packet) = latest_packet(&state.latest) else {
                continue;
            };
            let sequence = packet.metadata.frame_sequence;
            if last_sent == Some(sequence) {
                continue;
            }
            last_sent = Some(sequence);

            let mut payload = Vec::with_capacity(packet.jpeg.len() + 96);
            payload.extend_from_slice(b"--frame\r\n");
            payload.extend_from_slice(format!("X-Sequence: {sequence}\r\n").as_bytes());
            payload.extend_from_slice(format!("X-Layer: {}\r\n", packet.metadata.layer).as_bytes());
            payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
            payload.extend_from_slice(&packet.jpeg);
            payload.extend_from_slice(b"\r\n");
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        sync::{Arc, Mutex},
    };

    use super::*;

    fn empty_packet() -> SharedPacket {
        Arc::new(Mutex::new(None))
    }

    #[test]
    fn occupied_port_fails_startup() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let err = match spawn_preview_server(addr, empty_packet()) {
            Ok(server) => {
                server.stop();
                panic!("second listener on {addr} should not bind");
            }
            Err(err) => err,
        };

        assert!(err.to_string().contains("Failed to bind preview server"));
        assert!(err.downcast_ref::<io::Error>().is_some());
    }

    #[test]
    fn serves_no_content_before_first_frame() {
        let server = spawn_preview_server(([127, 0, 0, 1], 0).into(), empty_packet()).unwrap();

        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        stream
            .write_all(b"GET /frame.jpg HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();

        assert!(reply.starts_with("HTTP/1.1 204"), "{reply}");
        server.stop();
    }
}
