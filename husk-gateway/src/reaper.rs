//! Periodic stop of VMs whose timeout has passed.

use std::time::Duration;

use husk_executor::Orchestrator;
use tokio::task::JoinHandle;

/// How often expired VMs are looked for.
pub const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns a task that calls [`Orchestrator::reap_expired`] every `every`.
///
/// The first sweep runs immediately, so VMs that expired while the gateway
/// was down are stopped at startup.
#[must_use]
pub fn spawn(orchestrator: Orchestrator, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match orchestrator.reap_expired().await {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        if let Err(e) = outcome.result {
                            tracing::warn!(vm_id = %outcome.vm_id, error = %e, "could not stop expired VM");
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "timeout sweep failed"),
            }
        }
    })
}
