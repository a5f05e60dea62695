//! Prometheus metrics

use crate::domain::call::value_object::EndReason;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

/// Install the Prometheus exporter with an HTTP scrape endpoint on `listen`
pub fn init_metrics(listen: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()?;

    describe_counter!("ivr_calls_total", "Total number of calls entering the application");
    describe_counter!(
        "ivr_calls_rejected_total",
        "Calls turned away because the concurrency limit was reached"
    );
    describe_counter!(
        "ivr_calls_completed_total",
        "Calls whose script ran to completion"
    );
    describe_counter!(
        "ivr_calls_failed_total",
        "Calls whose script aborted on an error"
    );
    describe_counter!(
        "ivr_calls_finished_total",
        "Calls that left the application, labelled by end reason"
    );
    describe_gauge!("ivr_active_calls", "Number of call handlers currently running");
    describe_counter!("ivr_playbacks_total", "Total number of playbacks started");
    describe_counter!("ivr_playback_failures_total", "Total number of failed playbacks");

    Ok(())
}

/// Record a call handler starting
pub fn record_call_started() {
    counter!("ivr_calls_total").increment(1);
    gauge!("ivr_active_calls").increment(1.0);
}

/// Record a call turned away by admission control
pub fn record_call_rejected() {
    counter!("ivr_calls_rejected_total").increment(1);
}

/// Record a call handler finishing
pub fn record_call_finished(reason: &EndReason) {
    gauge!("ivr_active_calls").decrement(1.0);
    counter!("ivr_calls_finished_total", "reason" => reason.label()).increment(1);
    match reason {
        EndReason::Completed => counter!("ivr_calls_completed_total").increment(1),
        EndReason::ScriptFailed(_) => counter!("ivr_calls_failed_total").increment(1),
        _ => {}
    }
}
