use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Turns SIGINT/SIGTERM into a cancellation of the running stage.
///
/// The stage finishes its in-flight network call, records everything left
/// as not done, and the exports are still written.
#[derive(Clone)]
pub struct StopSignal {
    cancel_token: CancellationToken,
}

impl StopSignal {
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self { cancel_token }
    }

    pub fn register_handlers(&self) {
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = signal::ctrl_c().await {
                    error!(error = %e, "failed to install SIGINT handler");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(e) => {
                        error!(error = %e, "failed to install SIGTERM handler");
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT (Ctrl+C), stopping after the current request"),
                _ = terminate => info!("Received SIGTERM, stopping after the current request"),
            }
            cancel_token.cancel();
            warn!("Remaining recipients will be recorded as not processed");
        });
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}

/// Process exit codes.
#[derive(Debug, Clone, Copy)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    Stopped = 130,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}
