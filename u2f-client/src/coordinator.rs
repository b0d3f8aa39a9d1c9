//! Race one operation per connected key and keep the first satisfying result.

use futures::future::BoxFuture;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use u2f_hid::DeviceFactory;

use crate::config::ClientConfig;
use crate::error::Error;

/// Polls discovery and starts an operation for every key not already being worked on.
///
/// A key whose operation fails is forgotten and picked up again by the next poll if it is
/// still connected. A key whose operation completes without satisfying the predicate stays
/// known, so it is not asked again during this run.
pub struct Coordinator<F> {
    factory: Arc<F>,
    idle_poll_interval: Duration,
    active_poll_interval: Duration,
}

impl<F: DeviceFactory> Coordinator<F> {
    pub fn new(factory: Arc<F>, config: &ClientConfig) -> Coordinator<F> {
        Coordinator {
            factory,
            idle_poll_interval: config.idle_poll_interval(),
            active_poll_interval: config.active_poll_interval(),
        }
    }

    /// Run until some key produces a result satisfying `is_success` or `cancel` fires. Every
    /// started operation has finished by the time this returns.
    pub async fn run<R, Op, P>(
        &self,
        operation: Op,
        is_success: P,
        cancel: CancellationToken,
    ) -> Result<R, Error>
    where
        R: Send + 'static,
        Op: Fn(F::Identity, CancellationToken) -> BoxFuture<'static, Result<R, Error>>,
        P: Fn(&R) -> bool,
    {
        let operations_cancel = cancel.child_token();
        let mut tasks: JoinSet<(F::Identity, Result<R, Error>)> = JoinSet::new();
        let mut in_progress: HashSet<F::Identity> = HashSet::new();

        let result = 'run: loop {
            let discovered = tokio::select! {
                _ = cancel.cancelled() => break 'run Err(Error::Cancelled),
                discovered = self.factory.find_all() => discovered,
            };
            match discovered {
                Ok(identities) => {
                    for identity in identities {
                        if in_progress.insert(identity.clone()) {
                            debug!(?identity, "Starting operation on key");
                            let work = operation(identity.clone(), operations_cancel.child_token());
                            tasks.spawn(async move { (identity, work.await) });
                        }
                    }
                }
                Err(err) => warn!(error = %err, "Discovering keys failed"),
            }

            let interval = if in_progress.is_empty() {
                self.idle_poll_interval
            } else {
                self.active_poll_interval
            };
            let next_poll = tokio::time::sleep(interval);
            tokio::pin!(next_poll);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break 'run Err(Error::Cancelled),
                    _ = &mut next_poll => break,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                        Ok((identity, Ok(result))) => {
                            if is_success(&result) {
                                info!(?identity, "Key produced a result");
                                break 'run Ok(result);
                            }
                            debug!(?identity, "Key finished without a usable result");
                        }
                        Ok((identity, Err(err))) => {
                            debug!(?identity, error = %err, "Operation on key failed");
                            in_progress.remove(&identity);
                        }
                        Err(err) => error!(error = %err, "Operation task panicked"),
                    },
                }
            }
            trace!(in_progress = in_progress.len(), "Polling for keys");
        };

        operations_cancel.cancel();
        tasks.shutdown().await;
        result
    }
}
