use std::cell::Cell;
use std::time::Duration;

thread_local! {
    static INFERENCE_TIME_NS: Cell<u64> = const { Cell::new(0) };
}

pub fn reset_inference_time() {
    INFERENCE_TIME_NS.with(|cell| cell.set(0));
}

pub fn add_inference_time(duration: Duration) {
    let nanos = duration.as_nanos();
    let nanos = nanos.min(u128::from(u64::MAX)) as u64;
    INFERENCE_TIME_NS.with(|cell| {
        let current = cell.get();
        let next = current.saturating_add(nanos);
        cell.set(next);
    });
}

pub fn take_inference_time() -> Duration {
    INFERENCE_TIME_NS.with(|cell| {
        let nanos = cell.get();
        cell.set(0);
        Duration::from_nanos(nanos)
    })
}

/// Logs an inference duration and compares it with an optional soft deadline.
///
/// A zero `threshold` means none was supplied and always passes. Exceeding the
/// threshold is reported but never aborts anything.
pub fn check_inference_time_threshold(duration: Duration, threshold: Duration) -> bool {
    let inference_ms = duration.as_secs_f64() * 1000.0;
    tracing::info!(inference_ms, "inference time");
    if threshold.is_zero() {
        return true;
    }
    let threshold_ms = threshold.as_secs_f64() * 1000.0;
    if duration > threshold {
        tracing::warn!(
            inference_ms,
            threshold_ms,
            "elapsed inference time is greater than provided threshold"
        );
        return false;
    }
    tracing::info!(inference_ms, threshold_ms, "inference time within threshold");
    true
}
