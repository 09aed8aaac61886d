use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::state::AppState;

/// Handles to the background loops, stopped together
pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub fn start_background_workers(state: &AppState) -> Workers {
    let (shutdown, rx) = watch::channel(false);

    let sweeper = tokio::spawn(state.sweeper.clone().run(state.sweep_interval, rx.clone()));
    let relay = tokio::spawn(state.relay.clone().run(state.relay_interval, rx));

    info!(
        sweep_interval = ?state.sweep_interval,
        relay_interval = ?state.relay_interval,
        "Background workers started"
    );
    Workers {
        shutdown,
        handles: vec![sweeper, relay],
    }
}

impl Workers {
    /// Signal every loop and wait for it to finish its current pass
    pub async fn shutdown(self) {
        // Receivers may already be gone if a loop panicked
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background worker ended abnormally");
            }
        }
        info!("Background workers stopped");
    }
}
