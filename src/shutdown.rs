use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Two-stage shutdown state for a worker.
///
/// The first SIGINT/SIGTERM cancels `drain`: the current job finishes, then
/// the worker exits without claiming more. A second signal cancels `force`:
/// the supervisor terminates the running child immediately.
#[derive(Debug, Clone)]
pub struct Shutdown {
    drain: CancellationToken,
    force: CancellationToken,
}

impl Shutdown {
    /// A shutdown handle with no signal wiring, for tests and embedding.
    pub fn unarmed() -> Self {
        Self {
            drain: CancellationToken::new(),
            force: CancellationToken::new(),
        }
    }

    /// Install the SIGINT/SIGTERM listener and return the handle.
    pub fn install() -> std::io::Result<Self> {
        let this = Self::unarmed();
        let drain = this.drain.clone();
        let force = this.force.clone();

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::spawn(async move {
            let mut seen = 0u32;
            loop {
                tokio::select! {
                    _ = sigint.recv() => {}
                    _ = sigterm.recv() => {}
                }
                seen += 1;
                if seen == 1 {
                    tracing::info!("shutdown requested, finishing current job (signal again to force)");
                    drain.cancel();
                } else {
                    tracing::warn!("force shutdown requested, terminating current job");
                    force.cancel();
                    break;
                }
            }
        });

        Ok(this)
    }

    pub fn drain_requested(&self) -> bool {
        self.drain.is_cancelled()
    }

    pub fn force_requested(&self) -> bool {
        self.force.is_cancelled()
    }

    pub fn request_drain(&self) {
        self.drain.cancel();
    }

    pub fn request_force(&self) {
        self.drain.cancel();
        self.force.cancel();
    }

    /// Resolves when drain (or force) is requested.
    pub async fn drained(&self) {
        self.drain.cancelled().await;
    }

    /// Token view of the drain stage, for components that take a
    /// `CancellationToken` directly.
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }
}
