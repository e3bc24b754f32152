/**
 * broker.rs
 *
 * Location broker: owns the background session task and answers the
 * host's "get location" events out of the shared cache. Queries never
 * touch the network; worst case they report a failure result.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::channel::Channel;
use crate::config::ServerConfig;
use crate::events::{EventSink, LocationResponse};
use crate::location::LocationCache;
use crate::session::SessionMachine;

/// Location broker
///
/// Construction spawns the session task; `shutdown` signals it and
/// blocks until it has exited. The query callback may be invoked from
/// any thread at any time in between.
pub struct LocationBroker {
    cache: Arc<LocationCache>,
    sink: Arc<dyn EventSink>,

    run: Arc<AtomicBool>,
    stop: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl LocationBroker {
    /// Start the broker with its injected collaborators: credentials,
    /// a transport channel and the host's event sink.
    pub fn spawn<C>(config: ServerConfig, channel: C, sink: Arc<dyn EventSink>) -> Self
    where
        C: Channel + 'static,
    {
        let cache = Arc::new(LocationCache::new());
        let run = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(Notify::new());

        let machine = SessionMachine::new(Arc::new(config), channel, Arc::clone(&cache));
        let task = tokio::spawn(machine.run(Arc::clone(&run), Arc::clone(&stop)));

        info!("Location broker started");

        Self {
            cache,
            sink,
            run,
            stop,
            task: Some(task),
        }
    }

    /// Handle a "get location" event: snapshot the cache and submit
    /// exactly one response tagged with the request's group id.
    ///
    /// Success mirrors the cache freshness flag; before the first fix
    /// arrives the response carries zeroed fields and `success =
    /// false`. A sink failure is logged, never retried.
    pub fn handle_get_location(&self, group_id: u32) {
        let (fix, fresh) = self.cache.read();

        let response = LocationResponse {
            group_id,
            success: fresh,
            latitude: fix.latitude,
            longitude: fix.longitude,
            elevation: fix.elevation,
            facing: fix.facing,
        };

        if let Err(e) = self.sink.submit(response) {
            error!("Failed to submit location response: {}", e);
        }
    }

    /// Signal the session task and block until it has exited.
    pub async fn shutdown(mut self) {
        self.run.store(false, Ordering::SeqCst);
        // notify_one stores a permit, so a task that is mid-tick right
        // now still wakes as soon as it reaches its next wait.
        self.stop.notify_one();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Session task did not shut down cleanly: {}", e);
            }
        }

        info!("Location broker stopped");
    }
}
