//! Side signals that invalidate the derived content of every list item at once,
//! such as changed notification settings or the local date rolling over.
//!
//! ```text
//! settings changes ──→ run_debounced() ──(quiet for N ms)──→ on_settled()
//! day_changes()    ──────────────────────────────────────→ on_settled()
//! ```

use std::{future::Future, time::Duration};

use chrono::{DateTime, Local, TimeZone};
use futures_util::{Stream, StreamExt, pin_mut, stream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Used when the next local midnight can't be computed (e.g., it falls into a DST gap).
const DAY_ROLLOVER_FALLBACK: Duration = Duration::from_secs(60 * 60);


/// Coalesces bursts of `trigger` events into single calls to `on_settled`.
///
/// `on_settled` runs once `trigger` has been quiet for `quiet_period` after at least one event.
/// Each new event restarts the quiet period. If `trigger` ends while an event is pending,
/// `on_settled` runs one last time. The loop ends when `scope` is cancelled,
/// when `trigger` ends, or when `on_settled` returns `false`.
pub async fn run_debounced<St, F, Fut>(
    scope: CancellationToken,
    trigger: St,
    quiet_period: Duration,
    mut on_settled: F,
)
where
    St: Stream,
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    pin_mut!(trigger);
    let mut deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = scope.cancelled() => {
                debug!("Debounced trigger cancelled");
                break;
            }
            event = trigger.next() => match event {
                Some(_) => deadline = Some(Instant::now() + quiet_period),
                None => {
                    if deadline.take().is_some() {
                        on_settled().await;
                    }
                    info!("Debounced trigger stream ended");
                    break;
                }
            },
            _ = sleep_until_deadline(deadline) => {
                deadline = None;
                if !on_settled().await {
                    break;
                }
            }
        }
    }
}

/// Sleeps until `deadline`, or forever if there is none.
pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Returns how long it is from `now` until the next local midnight in `now`'s time zone.
pub fn duration_until_next_day<Tz: TimeZone>(now: &DateTime<Tz>) -> Duration {
    let next_midnight = now.date_naive()
        .succ_opt()
        .and_then(|tomorrow| tomorrow.and_hms_opt(0, 0, 0))
        .and_then(|midnight| now.timezone().from_local_datetime(&midnight).earliest());
    match next_midnight {
        Some(next) => (next - now.clone()).to_std().unwrap_or(DAY_ROLLOVER_FALLBACK),
        None => DAY_ROLLOVER_FALLBACK,
    }
}

/// A stream that yields once every time the local date changes.
pub fn day_changes() -> impl Stream<Item = ()> + Send + 'static {
    stream::unfold((), |()| async {
        let wait = duration_until_next_day(&Local::now());
        debug!(wait_secs = wait.as_secs(), "Waiting for the local date to roll over");
        tokio::time::sleep(wait).await;
        Some(((), ()))
    })
}
