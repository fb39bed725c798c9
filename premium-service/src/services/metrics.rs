use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use crate::models::{AttemptState, Channel, Provider};

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once; later calls
/// keep the first recorder.
pub fn init_metrics() -> anyhow::Result<()> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {}", e))?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

pub fn record_attempt(provider: Provider, state: AttemptState) {
    let labels = [
        ("provider", provider.as_str().to_string()),
        ("state", state.as_str().to_string()),
    ];
    counter!("premium_attempts_total", &labels).increment(1);
}

pub fn record_outcome(provider: Provider, channel: Channel, result: &'static str) {
    let labels = [
        ("provider", provider.as_str().to_string()),
        ("channel", channel.as_str().to_string()),
        ("result", result.to_string()),
    ];
    counter!("premium_outcomes_total", &labels).increment(1);
}

pub fn record_amount_mismatch(provider: Provider) {
    counter!("premium_amount_mismatch_total", "provider" => provider.as_str()).increment(1);
}

pub fn record_unknown_reference(provider: Provider, channel: Channel) {
    let labels = [
        ("provider", provider.as_str().to_string()),
        ("channel", channel.as_str().to_string()),
    ];
    counter!("premium_unknown_reference_total", &labels).increment(1);
}

pub fn record_rejected_callback(provider: Provider) {
    counter!("premium_rejected_callbacks_total", "provider" => provider.as_str()).increment(1);
}

pub fn record_sweep_run(outcome: &'static str, duration_secs: f64) {
    counter!("premium_sweep_runs_total", "outcome" => outcome).increment(1);
    histogram!("premium_sweep_duration_seconds").record(duration_secs);
}

pub fn record_stale_pending(provider: Provider) {
    counter!("premium_stale_pending_total", "provider" => provider.as_str()).increment(1);
}
