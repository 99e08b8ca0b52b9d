//! Operational metrics, recorded through the `metrics` facade and
//! exported by the binary's prometheus recorder.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

pub fn connected_clients(count: usize) {
    gauge!("zync_connected_clients").set(count as f64);
}

pub fn poke_sent() {
    counter!("zync_pokes_total").increment(1);
}

pub fn hydration(elapsed: Duration) {
    histogram!("zync_hydration_seconds").record(elapsed.as_secs_f64());
}

pub fn advance(elapsed: Duration, changes: usize) {
    histogram!("zync_advance_seconds").record(elapsed.as_secs_f64());
    counter!("zync_advance_changes_total").increment(changes as u64);
}

pub fn pipelines_reset() {
    counter!("zync_pipeline_resets_total").increment(1);
}

pub fn groups_collected(count: u64) {
    counter!("zync_groups_collected_total").increment(count);
}
