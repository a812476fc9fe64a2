use super::*;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Periodic trigger loop feeding the decision loop.
pub(crate) struct TriggerScheduler {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TriggerScheduler {
    /// The first trigger fires one `interval` after spawning.
    pub(crate) fn spawn(interval: Duration, commands: mpsc::WeakUnboundedSender<Command>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(commands) = commands.upgrade() else {
                            break;
                        };
                        if commands.send(Command::PeriodicTrigger).is_err() {
                            break;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("checkpoint scheduler stopped");
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub(crate) fn stop(self) {
        let _ = self.shutdown_tx.send(true);
    }
}
