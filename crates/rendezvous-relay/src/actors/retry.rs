//! Join retry timer tasks.
//!
//! When a join request targets an identity that has not yet appeared, the
//! dispatcher parks the envelope and arms one of these timers. The timer
//! never touches registry state itself: each tick re-enters the dispatcher
//! as a [`RelayCommand::RetryTick`], where the pending join's counter and
//! terminal conditions live. Cancellation is purely "stop rescheduling" -
//! the dispatcher cancels the token once the join completes or times out.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::messages::RelayCommand;

/// Spawn the tick timer for one pending join, keyed by (requester, target).
pub(crate) fn spawn_join_timer(
    sender: mpsc::Sender<RelayCommand>,
    requester: String,
    target: String,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(
                        target: "relay.retry",
                        requester = %requester,
                        join_target = %target,
                        "Join retry timer cancelled"
                    );
                    return;
                }
                () = tokio::time::sleep(interval) => {
                    let tick = RelayCommand::RetryTick {
                        requester: requester.clone(),
                        target: target.clone(),
                    };
                    if sender.send(tick).await.is_err() {
                        // Dispatcher gone; nothing left to tick.
                        return;
                    }
                }
            }
        }
    })
}
