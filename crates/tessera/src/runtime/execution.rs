//! Iteration loops over a loaded network, timed against a soft deadline.

use std::time::{Duration, Instant};

use crate::error::{Error, Result, Status};

use super::callback::CallbackManager;
use super::threadpool::{QosExecPriority, Threadpool};
use super::timing::{add_inference_time, check_inference_time_threshold};
use super::{InputTensors, NetworkId, OutputTensors, Runtime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationReport {
    pub iteration: usize,
    pub status: Status,
    pub duration: Duration,
    pub within_threshold: bool,
}

/// Runs each `(inputs, outputs)` pair on the caller's thread.
///
/// A zero `threshold` disables the deadline check.
pub fn run_synchronous(
    runtime: &Runtime,
    network: NetworkId,
    iterations: &mut [(InputTensors, OutputTensors)],
    threshold: Duration,
) -> Result<Vec<IterationReport>> {
    let mut reports = Vec::with_capacity(iterations.len());
    for (iteration, (inputs, outputs)) in iterations.iter_mut().enumerate() {
        let start = Instant::now();
        let status = runtime.enqueue_workload(network, inputs, outputs)?;
        let duration = start.elapsed();
        add_inference_time(duration);
        if !status.is_success() {
            tracing::error!(network = %network, iteration, "inference failed");
        }
        reports.push(IterationReport {
            iteration,
            status,
            duration,
            within_threshold: check_inference_time_threshold(duration, threshold),
        });
    }
    Ok(reports)
}

/// Schedules every iteration on `pool` and waits for all of them.
///
/// Reports are ordered by iteration; the duration of each is measured between the
/// worker's start and end timestamps.
pub fn run_asynchronous(
    pool: &Threadpool,
    network: NetworkId,
    iterations: Vec<(InputTensors, OutputTensors)>,
    priority: QosExecPriority,
    threshold: Duration,
) -> Result<Vec<(IterationReport, OutputTensors)>> {
    let manager = CallbackManager::new();
    let mut ids = Vec::with_capacity(iterations.len());
    for (inputs, outputs) in iterations {
        ids.push(pool.schedule(network, inputs, outputs, priority, manager.clone())?);
    }

    let mut results: Vec<Option<(IterationReport, OutputTensors)>> =
        (0..ids.len()).map(|_| None).collect();
    for _ in 0..ids.len() {
        let completion = manager
            .wait()
            .ok_or_else(|| Error::runtime("completion channel closed"))?;
        let iteration = ids
            .iter()
            .position(|id| *id == completion.inference_id)
            .ok_or_else(|| {
                Error::runtime(format!("unexpected completion {}", completion.inference_id))
            })?;
        let duration = completion.duration();
        if !completion.status.is_success() {
            tracing::error!(
                network = %network,
                iteration,
                cancelled = completion.cancelled,
                "inference failed"
            );
        }
        let report = IterationReport {
            iteration,
            status: completion.status,
            duration,
            within_threshold: check_inference_time_threshold(duration, threshold),
        };
        results[iteration] = Some((report, completion.outputs));
    }
    Ok(results.into_iter().flatten().collect())
}
