use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static JOBS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static JOBS_ACTIVE: OnceLock<IntGaugeVec> = OnceLock::new();
static CHAT_TURNS: OnceLock<IntCounterVec> = OnceLock::new();

/// Registers the process metrics. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let jobs_total = IntCounterVec::new(
        Opts::new("askdoc_jobs_total", "Finished job attempts per queue and outcome"),
        &["queue", "outcome"],
    )?;
    let jobs_active = IntGaugeVec::new(
        Opts::new("askdoc_jobs_active", "Jobs currently being processed"),
        &["queue"],
    )?;
    let chat_turns = IntCounterVec::new(
        Opts::new("askdoc_chat_turns_total", "Chat turns persisted, by cache write result"),
        &["cache"],
    )?;

    if JOBS_TOTAL.set(jobs_total.clone()).is_ok() {
        REGISTRY.register(Box::new(jobs_total))?;
    }
    if JOBS_ACTIVE.set(jobs_active.clone()).is_ok() {
        REGISTRY.register(Box::new(jobs_active))?;
    }
    if CHAT_TURNS.set(chat_turns.clone()).is_ok() {
        REGISTRY.register(Box::new(chat_turns))?;
    }
    Ok(())
}

/// `outcome` is one of `completed`, `retrying` or `failed`.
pub fn record_job(queue: &str, outcome: &str) {
    if let Some(counter) = JOBS_TOTAL.get() {
        counter.with_label_values(&[queue, outcome]).inc();
    }
}

pub fn job_started(queue: &str) {
    if let Some(gauge) = JOBS_ACTIVE.get() {
        gauge.with_label_values(&[queue]).inc();
    }
}

pub fn job_finished(queue: &str) {
    if let Some(gauge) = JOBS_ACTIVE.get() {
        gauge.with_label_values(&[queue]).dec();
    }
}

pub fn record_chat_turn(cache_written: bool) {
    if let Some(counter) = CHAT_TURNS.get() {
        let label = if cache_written { "written" } else { "skipped" };
        counter.with_label_values(&[label]).inc();
    }
}

/// Text exposition of every registered metric.
pub fn gather() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_counts_show_up() {
        init_metrics().unwrap();
        init_metrics().unwrap();

        record_job("metrics-test-queue", "completed");
        job_started("metrics-test-queue");
        job_finished("metrics-test-queue");
        record_chat_turn(true);

        let text = gather().unwrap();
        assert!(text.contains("askdoc_jobs_total"));
        assert!(text.contains("metrics-test-queue"));
        assert!(text.contains("askdoc_chat_turns_total"));
    }
}
