//! TCP server with deferred startup.
//!
//! `new()` allocates shared state, `start()` binds the listener and returns
//! the bound port, `serve()` accepts connections until the shutdown future
//! resolves and then drains.
//!
//! Each connection runs two tasks: a reader that frames the byte stream and
//! hands every frame to the [`RequestHandler`], and a writer that drains the
//! connection's outbound queue. The writer ends once every holder of the
//! connection handle (the reader and any request still in flight) is gone,
//! so responses to requests already accepted are still delivered after the
//! peer stops sending.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::codec::FrameCodec;
use super::connection::{ConnectionRegistry, OutboundMessage};
use super::shutdown::ShutdownController;
use crate::buffer::BufferTracker;
use crate::config::ContainerConfig;
use crate::handler::RequestHandler;
use crate::pipeline::ResponseSink;

/// Transport settings taken from [`ContainerConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub bind_address: String,
    pub max_frame_length: usize,
    pub drain_timeout: Duration,
}

impl From<&ContainerConfig> for ServerSettings {
    fn from(config: &ContainerConfig) -> Self {
        Self {
            bind_address: config.bind_address(),
            max_frame_length: config.max_frame_length,
            drain_timeout: config.drain_timeout(),
        }
    }
}

/// State shared by the accept loop and every connection task.
struct Shared {
    handler: Arc<RequestHandler>,
    buffers: BufferTracker,
    connections: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
    max_frame_length: usize,
}

pub struct SoaServer {
    settings: ServerSettings,
    listener: Option<TcpListener>,
    shared: Arc<Shared>,
}

impl SoaServer {
    /// Allocates the connection registry and shutdown controller without
    /// binding anything.
    #[must_use]
    pub fn new(settings: ServerSettings, handler: Arc<RequestHandler>, buffers: BufferTracker) -> Self {
        let shared = Shared {
            handler,
            buffers,
            connections: Arc::new(ConnectionRegistry::new()),
            shutdown: Arc::new(ShutdownController::new()),
            max_frame_length: settings.max_frame_length,
        };
        Self {
            settings,
            listener: None,
            shared: Arc::new(shared),
        }
    }

    #[must_use]
    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.shared.connections)
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shared.shutdown)
    }

    /// Binds the listener. Returns the bound port, which is OS-assigned
    /// when the configured port is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let listener = TcpListener::bind(&self.settings.bind_address).await?;
        let local = listener.local_addr()?;
        info!(address = %local, "listener bound");
        self.listener = Some(listener);
        Ok(local.port())
    }

    /// Accepts connections until `shutdown` resolves, then stops reading,
    /// waits for in-flight requests and closes every connection.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first.
    pub async fn serve(self, shutdown: impl Future<Output = ()> + Send) -> anyhow::Result<()> {
        let Some(listener) = self.listener else {
            anyhow::bail!("start() must be called before serve()");
        };
        let shared = self.shared;
        shared.shutdown.set_ready();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&shared);
                        tokio::spawn(async move { run_connection(stream, peer, shared).await });
                    }
                    Err(err) => warn!(error = %err, "failed to accept connection"),
                },
            }
        }
        drop(listener);

        drain(&shared, self.settings.drain_timeout).await;
        Ok(())
    }
}

impl std::fmt::Debug for SoaServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoaServer")
            .field("settings", &self.settings)
            .field("bound", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

async fn run_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let local = stream.local_addr().ok();
    if let Err(err) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY");
    }
    let (read_half, write_half) = stream.into_split();
    let (handle, outbound) = shared.connections.register(Some(peer), local);
    debug!(peer = %peer, id = handle.id.0, "connection opened");

    let writer = tokio::spawn(write_loop(
        FramedWrite::new(write_half, FrameCodec::new(shared.max_frame_length)),
        outbound,
    ));

    let mut frames = FramedRead::new(read_half, FrameCodec::new(shared.max_frame_length));
    let mut stopping = shared.shutdown.subscribe();
    loop {
        tokio::select! {
            () = async { let _ = stopping.wait_for(|stopped| *stopped).await; } => break,
            next = frames.next() => match next {
                Some(Ok(bytes)) => {
                    if !shared.shutdown.is_accepting() {
                        break;
                    }
                    let frame = shared.buffers.acquire(bytes);
                    let responder = Arc::clone(&handle) as Arc<dyn ResponseSink>;
                    let result = shared.handler.on_frame(
                        frame,
                        responder,
                        handle.info,
                        shared.shutdown.in_flight_guard(),
                    );
                    if let Err(err) = result {
                        warn!(peer = %peer, error = %err, "undecodable request, closing connection");
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!(peer = %peer, error = %err, "framing error, closing connection");
                    break;
                }
                None => break,
            },
        }
    }

    shared.connections.remove(handle.id);
    drop(handle);
    if let Err(err) = writer.await {
        warn!(peer = %peer, error = %err, "connection writer task failed");
    }
    debug!(peer = %peer, "connection closed");
}

async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
) {
    while let Some(message) = outbound.recv().await {
        match message {
            OutboundMessage::Frame(frame) => {
                if let Err(err) = sink.send(frame).await {
                    debug!(error = %err, "write failed, dropping connection writer");
                    return;
                }
            }
            OutboundMessage::Close => break,
        }
    }
    if let Err(err) = sink.close().await {
        debug!(error = %err, "failed to shut down write half");
    }
}

/// Stops readers, waits for in-flight requests, then closes what is left.
async fn drain(shared: &Shared, timeout: Duration) {
    shared.shutdown.trigger_shutdown();

    if shared.shutdown.wait_for_drain(timeout).await {
        info!("in-flight requests drained");
    } else {
        warn!(
            remaining = shared.shutdown.in_flight_count(),
            "drain timeout expired with requests in flight"
        );
    }

    let handles = shared.connections.drain_all();
    if !handles.is_empty() {
        info!(count = handles.len(), "closing connections");
        for handle in &handles {
            handle.close();
        }
    }
}
