use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use gridfire_core::{Pipeline, notify::NotificationHub};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    /// Local SSE sessions. Fed directly by in-process workers, or by the
    /// Redis relay when workers run elsewhere.
    pub hub: Arc<NotificationHub>,
    pub readiness: Readiness,
    /// Fired on process shutdown; open event streams end with it.
    pub shutdown: CancellationToken,
    pub max_upload_bytes: u64,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("ready", &self.readiness.is_ready())
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish_non_exhaustive()
    }
}

impl AppState {
    pub fn new(pipeline: Pipeline, hub: Arc<NotificationHub>, max_upload_bytes: u64) -> Self {
        Self {
            pipeline,
            hub,
            readiness: Readiness::default(),
            shutdown: CancellationToken::new(),
            max_upload_bytes,
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// Backs `/readyz`: false until wiring finishes and again once shutdown
/// has begun.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn mark_draining(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
