//! Push channel producer
//!
//! Holds `GET /rooms/stream` open and forwards every membership event to
//! the reconciler. A dropped stream is reopened after a pause; polling
//! keeps running meanwhile, so push only makes reconciliation faster.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::MembershipUpdate;
use crate::api::Backend;
use crate::error::AppError;
use crate::events::UpdateSource;
use crate::utils::LogThrottler;
use crate::warn_throttled;

pub struct PushChannel {
    backend: Arc<dyn Backend>,
    updates: mpsc::Sender<MembershipUpdate>,
    retry: Duration,
    throttler: LogThrottler,
}

impl PushChannel {
    pub fn new(backend: Arc<dyn Backend>, updates: mpsc::Sender<MembershipUpdate>, retry: Duration) -> Self {
        Self {
            backend,
            updates,
            retry,
            throttler: LogThrottler::default(),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = self.backend.subscribe_rooms() => opened,
            };
            match opened {
                Ok(mut stream) => {
                    if self.throttler.clear("push") {
                        info!("Push channel reconnected");
                    } else {
                        debug!("Push channel open");
                    }

                    loop {
                        let item = tokio::select! {
                            _ = cancel.cancelled() => return,
                            item = stream.next() => item,
                        };
                        match item {
                            Some(Ok(update)) => {
                                let update = MembershipUpdate {
                                    source: UpdateSource::Push,
                                    rooms: update.rooms,
                                    capacity: update.capacity,
                                };
                                if self.updates.send(update).await.is_err() {
                                    debug!("Reconciler gone, closing push channel");
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                warn_throttled!(self.throttler, "push", "Push channel broke: {}", e);
                                break;
                            }
                            None => {
                                debug!("Push channel closed by server");
                                break;
                            }
                        }
                    }
                }
                Err(AppError::ServiceUnavailable(_)) => {
                    info!("Server has no push channel, relying on polling");
                    return;
                }
                Err(e) => {
                    warn_throttled!(self.throttler, "push", "Push channel unavailable: {}", e);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.retry) => {}
            }
        }
    }
}
