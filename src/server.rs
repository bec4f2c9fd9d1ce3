//! Server bootstrap
//!
//! Binds the client and HTTP listeners, spawns the coordinator, and runs
//! the accept loop with its max-connection cap. Everything is tied to one
//! cancellation token and one task tracker so shutdown is a single cancel
//! plus a bounded wait.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::client::{self, ClientId};
use crate::config::ServerConfig;
use crate::coordinator::{Coordinator, Event};
use crate::http;

/// A running server and the handles to stop it.
pub struct Server {
    /// Where the client protocol listener actually bound.
    pub client_addr: SocketAddr,
    /// Where the HTTP status listener actually bound.
    pub http_addr: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    /// Bind listeners, start the coordinator and accept loop, and return.
    pub async fn start(config: ServerConfig) -> Result<Server> {
        let client_listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .with_context(|| format!("could not bind the data server to port {}", config.port))?;
        let client_addr = client_listener.local_addr()?;

        let http_listener = TcpListener::bind(("0.0.0.0", config.http_port))
            .await
            .with_context(|| {
                format!("could not bind the status server to port {}", config.http_port)
            })?;
        let http_addr = http_listener.local_addr()?;

        info!(
            port = client_addr.port(),
            max_connections = config.max_connections,
            "data server listening"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let client_count = Arc::new(AtomicUsize::new(0));
        let max_connections = config.max_connections;

        let coordinator = Coordinator::new(
            config,
            events_rx,
            events_tx.clone(),
            Arc::clone(&client_count),
            cancel.clone(),
        );
        tracker.spawn(coordinator.run());

        let http_events = events_tx.clone();
        let http_cancel = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = http::serve(http_listener, http_events, http_cancel).await {
                error!(error = %e, "HTTP status server exited");
            }
        });

        tracker.spawn(accept_loop(
            client_listener,
            max_connections,
            client_count,
            events_tx.clone(),
            tracker.clone(),
            cancel.clone(),
        ));
        tracker.close();

        Ok(Server {
            client_addr,
            http_addr,
            events: events_tx,
            cancel,
            tracker,
        })
    }

    /// The coordinator's event channel, for embedding and tests.
    pub fn events(&self) -> mpsc::UnboundedSender<Event> {
        self.events.clone()
    }

    /// Cancel everything and wait, bounded, for tasks to drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if tokio::time::timeout(Duration::from_secs(5), self.tracker.wait())
            .await
            .is_err()
        {
            warn!("shutdown timed out after 5s");
        }
    }
}

/// Admit connections up to the cap; turn the rest away at the door.
async fn accept_loop(
    listener: TcpListener,
    max_connections: usize,
    client_count: Arc<AtomicUsize>,
    events: mpsc::UnboundedSender<Event>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) {
    let mut next_id: ClientId = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if client_count.load(Ordering::Relaxed) >= max_connections {
                        warn!(
                            client = %addr,
                            "connection attempt while already at the maximum number \
                             of connected clients, ignoring it"
                        );
                        continue;
                    }
                    client_count.fetch_add(1, Ordering::Relaxed);
                    let id = next_id;
                    next_id += 1;
                    let session =
                        client::spawn_connection(id, stream, addr, events.clone(), &tracker, &cancel);
                    if events.send(Event::ClientConnected { session }).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "could not accept a client connection"),
            },
        }
    }
}
