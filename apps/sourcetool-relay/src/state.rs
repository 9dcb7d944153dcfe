use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::auth::Authenticator;
use crate::router::ProtocolRouter;

#[derive(Clone)]
pub struct AppState {
    start: Instant,
    instance_id: String,
    router: ProtocolRouter,
    authenticator: Arc<dyn Authenticator>,
    write_wait: Duration,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        instance_id: String,
        router: ProtocolRouter,
        authenticator: Arc<dyn Authenticator>,
        write_wait: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            start: Instant::now(),
            instance_id,
            router,
            authenticator,
            write_wait,
            shutdown,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn router(&self) -> &ProtocolRouter {
        &self.router
    }

    pub fn authenticator(&self) -> &dyn Authenticator {
        self.authenticator.as_ref()
    }

    pub fn write_wait(&self) -> Duration {
        self.write_wait
    }

    /// Cancelled when the process starts shutting down.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}
