//! Fixed pool of worker threads executing scheduled inferences.
//!
//! Every worker owns one [`WorkingMemory`] per network it serves, so workers never
//! share mutable tensor state. The only synchronized structure is the request
//! queue. Requests are taken by priority, FIFO within a priority class. A class that
//! has been served [`EXPIRE_RATE`] times in a row yields one turn to the next lower
//! class that has work waiting.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::env;
use crate::error::{Error, Result, Status};

use super::callback::{ExecutionCallback, InferenceCompletion, InferenceId};
use super::loaded::LoadedNetwork;
use super::working_memory::WorkingMemory;
use super::{InputTensors, NetworkId, OutputTensors, Runtime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum QosExecPriority {
    Low,
    #[default]
    Medium,
    High,
}

struct Request {
    id: InferenceId,
    network: NetworkId,
    inputs: InputTensors,
    outputs: OutputTensors,
    callback: Arc<dyn ExecutionCallback>,
}

impl Request {
    fn cancel(self) {
        let now = Instant::now();
        self.callback.notify(InferenceCompletion {
            inference_id: self.id,
            network_id: self.network,
            status: Status::Failure,
            cancelled: true,
            start: now,
            end: now,
            outputs: self.outputs,
            error: None,
        });
    }
}

/// Consecutive pops a priority class gets while a lower class is waiting.
const EXPIRE_RATE: usize = 3;

#[derive(Default)]
struct Queues {
    high: VecDeque<Request>,
    medium: VecDeque<Request>,
    low: VecDeque<Request>,
    high_streak: usize,
    medium_streak: usize,
    shutdown: bool,
}

impl Queues {
    fn queue_mut(&mut self, priority: QosExecPriority) -> &mut VecDeque<Request> {
        match priority {
            QosExecPriority::High => &mut self.high,
            QosExecPriority::Medium => &mut self.medium,
            QosExecPriority::Low => &mut self.low,
        }
    }

    fn pop(&mut self) -> Option<Request> {
        if self.high_streak < EXPIRE_RATE {
            if let Some(request) = self.high.pop_front() {
                self.high_streak += 1;
                return Some(request);
            }
        }
        if self.medium_streak < EXPIRE_RATE {
            if let Some(request) = self.medium.pop_front() {
                self.high_streak = 0;
                self.medium_streak += 1;
                return Some(request);
            }
        }
        self.high_streak = 0;
        self.medium_streak = 0;
        if let Some(request) = self.low.pop_front() {
            return Some(request);
        }
        // Nothing below the exhausted classes is waiting.
        if let Some(request) = self.high.pop_front() {
            self.high_streak = 1;
            return Some(request);
        }
        let request = self.medium.pop_front()?;
        self.medium_streak = 1;
        Some(request)
    }

    fn drain(&mut self) -> Vec<Request> {
        let mut drained: Vec<Request> = self.high.drain(..).collect();
        drained.extend(self.medium.drain(..));
        drained.extend(self.low.drain(..));
        drained
    }
}

struct Shared {
    queues: Mutex<Queues>,
    available: Condvar,
}

pub struct Threadpool {
    shared: Arc<Shared>,
    networks: Arc<HashMap<NetworkId, Arc<LoadedNetwork>>>,
    workers: Vec<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl Threadpool {
    /// Starts `num_threads` workers serving `networks`.
    ///
    /// `0` uses `TESSERA_THREADPOOL_SIZE`. Every network must have been loaded
    /// with `async_enabled`.
    pub fn new(runtime: &Runtime, networks: &[NetworkId], num_threads: usize) -> Result<Self> {
        let num_threads = if num_threads == 0 {
            env::default_threadpool_size()
        } else {
            num_threads
        };
        if networks.is_empty() {
            return Err(Error::invalid_argument(
                "threadpool needs at least one network",
            ));
        }

        let mut served = HashMap::with_capacity(networks.len());
        for &id in networks {
            let network = runtime.network(id)?;
            if !network.properties().async_enabled {
                return Err(Error::invalid_argument(format!(
                    "network {id} was not loaded with async execution enabled"
                )));
            }
            served.insert(id, network);
        }
        let networks = Arc::new(served);

        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues::default()),
            available: Condvar::new(),
        });

        let mut per_worker = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            let mut memories = HashMap::with_capacity(networks.len());
            for (&id, network) in networks.iter() {
                memories.insert(id, network.create_working_memory()?);
            }
            per_worker.push(memories);
        }

        let mut workers = Vec::with_capacity(num_threads);
        for (index, memories) in per_worker.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let networks = Arc::clone(&networks);
            let handle = std::thread::Builder::new()
                .name(format!("tessera-worker-{index}"))
                .spawn(move || worker_loop(index, &shared, &networks, memories))
                .map_err(|err| Error::runtime(format!("failed to spawn worker: {err}")))?;
            workers.push(handle);
        }
        tracing::info!(workers = num_threads, networks = networks.len(), "threadpool started");

        Ok(Self {
            shared,
            networks,
            workers,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Queues one inference. The callback is notified exactly once.
    pub fn schedule(
        &self,
        network: NetworkId,
        inputs: InputTensors,
        outputs: OutputTensors,
        priority: QosExecPriority,
        callback: Arc<dyn ExecutionCallback>,
    ) -> Result<InferenceId> {
        if !self.networks.contains_key(&network) {
            return Err(Error::invalid_argument(format!(
                "network {network} is not served by this threadpool"
            )));
        }
        let id = InferenceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let request = Request {
            id,
            network,
            inputs,
            outputs,
            callback,
        };
        {
            let mut queues = self
                .shared
                .queues
                .lock()
                .expect("threadpool queue lock poisoned");
            if queues.shutdown {
                return Err(Error::runtime("threadpool is shutting down"));
            }
            queues.queue_mut(priority).push_back(request);
        }
        self.shared.available.notify_one();
        tracing::debug!(inference = %id, network = %network, ?priority, "inference scheduled");
        Ok(id)
    }

    /// Drops every request that has not started yet. Running inferences finish normally.
    pub fn cancel_pending(&self) -> usize {
        let drained = self
            .shared
            .queues
            .lock()
            .expect("threadpool queue lock poisoned")
            .drain();
        let count = drained.len();
        for request in drained {
            request.cancel();
        }
        count
    }
}

impl Drop for Threadpool {
    fn drop(&mut self) {
        let drained = {
            let mut queues = self
                .shared
                .queues
                .lock()
                .expect("threadpool queue lock poisoned");
            queues.shutdown = true;
            queues.drain()
        };
        for request in drained {
            request.cancel();
        }
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("threadpool worker panicked");
            }
        }
        tracing::info!("threadpool stopped");
    }
}

impl std::fmt::Debug for Threadpool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Threadpool")
            .field("workers", &self.workers.len())
            .field("networks", &self.networks.len())
            .finish()
    }
}

fn worker_loop(
    index: usize,
    shared: &Shared,
    networks: &HashMap<NetworkId, Arc<LoadedNetwork>>,
    memories: HashMap<NetworkId, WorkingMemory>,
) {
    tracing::debug!(worker = index, "worker started");
    loop {
        let request = {
            let mut queues = shared
                .queues
                .lock()
                .expect("threadpool queue lock poisoned");
            loop {
                if let Some(request) = queues.pop() {
                    break Some(request);
                }
                if queues.shutdown {
                    break None;
                }
                queues = shared
                    .available
                    .wait(queues)
                    .expect("threadpool queue lock poisoned");
            }
        };
        let Some(request) = request else {
            break;
        };
        run_request(index, request, networks, &memories);
    }
    tracing::debug!(worker = index, "worker stopped");
}

fn run_request(
    worker: usize,
    request: Request,
    networks: &HashMap<NetworkId, Arc<LoadedNetwork>>,
    memories: &HashMap<NetworkId, WorkingMemory>,
) {
    let Request {
        id,
        network: network_id,
        inputs,
        mut outputs,
        callback,
    } = request;
    let _span = tracing::debug_span!("inference", worker, inference = %id, network = %network_id)
        .entered();
    let start = Instant::now();
    let result = match (networks.get(&network_id), memories.get(&network_id)) {
        (Some(network), Some(memory)) => network.execute(memory, &inputs, &mut outputs),
        _ => Err(Error::invalid_argument(format!(
            "network {network_id} is not served by this threadpool"
        ))),
    };
    let end = Instant::now();
    let (status, error) = match result {
        Ok(status) => (status, None),
        Err(err) => {
            tracing::error!(error = %err, "scheduled inference failed");
            (Status::Failure, Some(err.to_string()))
        }
    };
    callback.notify(InferenceCompletion {
        inference_id: id,
        network_id,
        status,
        cancelled: false,
        start,
        end,
        outputs,
        error,
    });
}
