use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::Generation;
use crate::types::config::ListenerKind;

/// How long a new accept loop waits for its predecessor to let go of the socket
const RETIRE_WAIT: Duration = Duration::from_secs(5);

/// An HTTP listener that can be started, stopped and restarted at runtime.
///
/// `start` and `stop` never block on socket teardown. The accept loop runs
/// on its own task; a bind that completes after the listener was stopped
/// or restarted is closed instead of published.
pub struct ManagedListener {
    kind: ListenerKind,
    router: Router,
    generation: Generation,
    state: Mutex<ListenerState>,
}

#[derive(Default)]
struct ListenerState {
    requested: Option<SocketAddr>,
    bound: Option<BoundSocket>,
    worker: Option<JoinHandle<()>>,
    /// Worker of a stopped generation that may still hold the socket
    retiring: Option<JoinHandle<()>>,
}

struct BoundSocket {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
}

impl ManagedListener {
    pub fn new(kind: ListenerKind, router: Router) -> Arc<Self> {
        Arc::new(Self {
            kind,
            router,
            generation: Generation::new(),
            state: Mutex::new(ListenerState::default()),
        })
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    /// Start listening on `addr`.
    ///
    /// No-op when already serving (or about to serve) the same address;
    /// restarts when a different address is requested. Must be called from
    /// within a Tokio runtime.
    pub fn start(self: &Arc<Self>, addr: SocketAddr) {
        let mut state = self.state.lock();

        let worker_alive = state.worker.as_ref().is_some_and(|w| !w.is_finished());
        if worker_alive && state.requested == Some(addr) {
            return;
        }
        if state.worker.is_some() || state.bound.is_some() {
            self.stop_locked(&mut state);
        }

        let generation = self.generation.begin();
        state.requested = Some(addr);
        let predecessor = state.retiring.take();

        let this = Arc::clone(self);
        state.worker = Some(tokio::spawn(async move {
            this.run(generation, addr, predecessor).await;
        }));
    }

    /// Stop listening. Safe to call any number of times.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.worker.is_none() && state.bound.is_none() {
            return;
        }
        self.stop_locked(&mut state);
    }

    fn stop_locked(&self, state: &mut ListenerState) {
        self.generation.invalidate();
        if let Some(bound) = state.bound.take() {
            tracing::info!("Stopping {} listener on {}", self.kind, bound.local_addr);
            let _ = bound.shutdown.send(());
        }
        state.requested = None;
        if let Some(worker) = state.worker.take() {
            state.retiring = Some(worker);
        }
    }

    /// True while a socket is published and its accept loop is alive
    pub fn is_running(&self) -> bool {
        let state = self.state.lock();
        state.bound.is_some() && state.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Address of the published socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().bound.as_ref().map(|b| b.local_addr)
    }

    async fn run(self: Arc<Self>, generation: u64, addr: SocketAddr, predecessor: Option<JoinHandle<()>>) {
        if let Some(previous) = predecessor {
            if tokio::time::timeout(RETIRE_WAIT, previous).await.is_err() {
                tracing::warn!("Previous {} listener did not exit in time", self.kind);
            }
        }
        if !self.generation.is_current(generation) {
            return;
        }

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Failed to bind {} listener on {}: {}", self.kind, addr, e);
                self.clear_if_current(generation);
                return;
            }
        };
        let local_addr = listener.local_addr().unwrap_or(addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if !self.generation.is_current(generation) {
                tracing::debug!("Discarding late bind of {} listener on {}", self.kind, local_addr);
                return;
            }
            state.bound = Some(BoundSocket {
                local_addr,
                shutdown: shutdown_tx,
            });
        }

        tracing::info!("{} listener started on http://{}", self.kind, local_addr);

        let served = axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = served {
            tracing::warn!("{} listener on {} failed: {}", self.kind, local_addr, e);
        }

        self.clear_if_current(generation);
        tracing::info!("{} listener on {} closed", self.kind, local_addr);
    }

    fn clear_if_current(&self, generation: u64) {
        let mut state = self.state.lock();
        if self.generation.is_current(generation) {
            state.bound = None;
            state.requested = None;
            state.worker = None;
        }
    }
}
