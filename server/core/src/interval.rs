//! Scheduled maintenance run inside the server: key rotation checks and
//! purging of expired codes, tokens and sessions.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::{interval, Duration, MissedTickBehavior};

use tunnistamod_lib::idm::server::IdmServer;
use tunnistamod_lib::prelude::duration_from_epoch_now;

use crate::CoreAction;

const MAINTENANCE_FREQUENCY_SECONDS: u64 = 600;

pub(crate) struct IntervalActor;

impl IntervalActor {
    pub fn start(
        idms: Arc<IdmServer>,
        mut rx: broadcast::Receiver<CoreAction>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut inter = interval(Duration::from_secs(MAINTENANCE_FREQUENCY_SECONDS));
            inter.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                let ct = duration_from_epoch_now();
                match idms.rotate_keys(ct).await {
                    Ok(outcome) => {
                        if !outcome.is_noop() {
                            admin_info!(
                                generated = ?outcome.generated,
                                expired = outcome.expired.len(),
                                purged = outcome.purged.len(),
                                "Scheduled key rotation applied"
                            );
                        }
                    }
                    Err(err) => {
                        admin_error!(?err, "Scheduled key rotation failed");
                    }
                }
                match idms.purge_expired(ct).await {
                    Ok(purged) if purged > 0 => {
                        admin_info!(purged, "Purged expired artifacts");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        admin_error!(?err, "Scheduled purge failed");
                    }
                }

                tokio::select! {
                    Ok(action) = rx.recv() => {
                        match action {
                            CoreAction::Shutdown => break,
                        }
                    }
                    _ = inter.tick() => {
                        // Next iter.
                        continue
                    }
                }
            }

            info!("Stopped IntervalActor");
        })
    }
}
