//! The janitor: a long-lived periodic task that purges content entries
//! older than 24 hours.

use std::time::Duration;

use chrono::Timelike;

use crate::store::Store;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const MAX_AGE: chrono::Duration = chrono::Duration::seconds(86_400);

/// Spawns the janitor as a detached task. Offsets its first tick to land 11
/// seconds into the next half-hour boundary so two processes sharing a
/// clock do not sweep in lockstep, then ticks every 30 minutes after that.
pub fn spawn_janitor(store: Store) {
    tokio::spawn(async move {
        tokio::time::sleep(delay_to_next_offset()).await;
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            sweep(&store).await;
        }
    });
}

/// Computes how long to sleep so the first sweep lands at `:00:11` or
/// `:30:11` of the wall clock.
fn delay_to_next_offset() -> Duration {
    let now = chrono::Utc::now();
    let second_of_half_hour = (now.minute() % 30) * 60 + now.second();
    let target = 11u32;
    let period = 30 * 60;
    let remaining = if second_of_half_hour < target {
        target - second_of_half_hour
    } else {
        period - second_of_half_hour + target
    };
    Duration::from_secs(remaining as u64)
}

/// Runs one sweep: deletes every entry whose `stored.datetime` is more than
/// 24 hours in the past. Per-entry failures (missing metadata, locked
/// files) are logged and skipped — the sweep never aborts early.
async fn sweep(store: &Store) {
    let ids = match store.list_content_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "janitor sweep failed to list entries");
            return;
        }
    };

    let now = chrono::Utc::now().naive_utc();
    let mut deleted = 0u32;

    for id in ids {
        let meta = match store.read_meta(&id).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(content_id = %id, error = %e, "janitor: skipping entry with unreadable metadata");
                continue;
            }
        };

        let age = now.signed_duration_since(meta.stored_datetime);
        if age > MAX_AGE {
            if let Err(e) = store.delete(&id).await {
                tracing::warn!(content_id = %id, error = %e, "janitor: failed to delete aged entry");
            } else {
                deleted += 1;
            }
        }
    }

    if deleted > 0 {
        tracing::info!(deleted, "janitor sweep complete");
    }
}
