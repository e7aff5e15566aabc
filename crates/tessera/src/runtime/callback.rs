use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Status;

use super::{NetworkId, OutputTensors};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InferenceId(pub u64);

impl std::fmt::Display for InferenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "inference#{}", self.0)
    }
}

/// Completion record handed to a callback once a scheduled inference is done.
#[derive(Debug)]
pub struct InferenceCompletion {
    pub inference_id: InferenceId,
    pub network_id: NetworkId,
    pub status: Status,
    /// The request was dropped from the queue before it started.
    pub cancelled: bool,
    pub start: Instant,
    pub end: Instant,
    /// Output tensors handed back to the caller, filled on success.
    pub outputs: OutputTensors,
    pub error: Option<String>,
}

impl InferenceCompletion {
    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

pub trait ExecutionCallback: Send + Sync {
    fn notify(&self, completion: InferenceCompletion);
}

/// Collects completions on a channel so a caller can wait for them in order of arrival.
pub struct CallbackManager {
    sender: Mutex<Sender<InferenceCompletion>>,
    receiver: Mutex<Receiver<InferenceCompletion>>,
}

impl CallbackManager {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::channel();
        Arc::new(Self {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
        })
    }

    /// Blocks until the next completion arrives.
    pub fn wait(&self) -> Option<InferenceCompletion> {
        self.receiver
            .lock()
            .expect("callback receiver lock poisoned")
            .recv()
            .ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<InferenceCompletion> {
        match self
            .receiver
            .lock()
            .expect("callback receiver lock poisoned")
            .recv_timeout(timeout)
        {
            Ok(completion) => Some(completion),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_next(&self) -> Option<InferenceCompletion> {
        match self
            .receiver
            .lock()
            .expect("callback receiver lock poisoned")
            .try_recv()
        {
            Ok(completion) => Some(completion),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

impl ExecutionCallback for CallbackManager {
    fn notify(&self, completion: InferenceCompletion) {
        let sender = self.sender.lock().expect("callback sender lock poisoned");
        // The receiver lives as long as self.
        let _ = sender.send(completion);
    }
}

impl std::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackManager").finish_non_exhaustive()
    }
}
