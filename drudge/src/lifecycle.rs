//! Stop conditions for a running worker: cooperative shutdown and the cooldown deadline.
use std::time::Duration;

use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

/// Why a worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The configured cooldown elapsed.
    Cooldown,
    /// Shutdown was requested through the token or a termination signal.
    Shutdown,
}

/// Tracks the stop conditions of a single worker run.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    shutdown: CancellationToken,
    deadline: Option<Instant>,
}

impl Lifecycle {
    /// Starts tracking from now. A cooldown of `None` runs until shutdown.
    pub fn start(shutdown: CancellationToken, cooldown: Option<Duration>) -> Self {
        Self {
            shutdown,
            deadline: cooldown.map(|cooldown| Instant::now() + cooldown),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether the loop should stop before claiming another job.
    ///
    /// A shutdown request wins over an elapsed cooldown.
    pub fn stop_reason(&self) -> Option<ExitReason> {
        if self.shutdown.is_cancelled() {
            Some(ExitReason::Shutdown)
        } else if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            Some(ExitReason::Cooldown)
        } else {
            None
        }
    }

    /// Sleeps for `poll`, waking early on shutdown or when the cooldown deadline passes.
    pub async fn idle(&self, poll: Duration) {
        let wake = match self.deadline {
            Some(deadline) => deadline.min(Instant::now() + poll),
            None => Instant::now() + poll,
        };
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

/// Cancels `shutdown` on SIGTERM or SIGINT (Ctrl-C elsewhere).
pub fn listen_for_signals(shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = termination_signal() => match result {
                Ok(()) => {
                    tracing::info!("Received termination signal, finishing current job");
                    shutdown.cancel();
                }
                Err(error) => tracing::error!(?error, "Failed to listen for termination signals: {error}"),
            },
            _ = shutdown.cancelled() => {}
        }
    })
}

#[cfg(unix)]
async fn termination_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = terminate.recv() => {}
        _ = interrupt.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn termination_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn cooldown_elapses() {
        let lifecycle = Lifecycle::start(CancellationToken::new(), Some(Duration::from_secs(2)));
        assert_eq!(lifecycle.stop_reason(), None);

        lifecycle.idle(Duration::from_secs(1)).await;
        assert_eq!(lifecycle.stop_reason(), None);

        lifecycle.idle(Duration::from_secs(5)).await;
        assert_eq!(lifecycle.stop_reason(), Some(ExitReason::Cooldown));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_wakes_on_shutdown() {
        let lifecycle = Lifecycle::start(CancellationToken::new(), None);
        let started = Instant::now();

        let idle = lifecycle.idle(Duration::from_secs(60));
        lifecycle.request_shutdown();
        idle.await;

        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(lifecycle.stop_reason(), Some(ExitReason::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_wins_over_cooldown() {
        let lifecycle = Lifecycle::start(CancellationToken::new(), Some(Duration::ZERO));
        lifecycle.request_shutdown();

        assert_eq!(lifecycle.stop_reason(), Some(ExitReason::Shutdown));
    }

    #[tokio::test]
    async fn signal_listener_stops_with_token() {
        let shutdown = CancellationToken::new();
        let handle = listen_for_signals(shutdown.clone());

        shutdown.cancel();

        handle.await.unwrap();
    }
}
