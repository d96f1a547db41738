use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use weft_engine::Dispatcher;

/// Shared state of a peer server.
pub struct PeerState {
    pub dispatcher: Arc<Dispatcher>,
    pub verbose_errors: bool,
    executions: Mutex<HashMap<String, CancellationToken>>,
}

impl PeerState {
    pub fn new(dispatcher: Arc<Dispatcher>, verbose_errors: bool) -> Self {
        Self {
            dispatcher,
            verbose_errors,
            executions: Mutex::new(HashMap::new()),
        }
    }

    /// Track an execution. `false` when the id is already in use.
    pub fn register(&self, execution_id: &str, cancel: CancellationToken) -> bool {
        let mut executions = self.executions.lock().unwrap_or_else(|e| e.into_inner());
        if executions.contains_key(execution_id) {
            return false;
        }
        executions.insert(execution_id.to_string(), cancel);
        true
    }

    /// Cancel a tracked execution. `false` when it is unknown or finished.
    pub fn cancel(&self, execution_id: &str) -> bool {
        let executions = self.executions.lock().unwrap_or_else(|e| e.into_inner());
        match executions.get(execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn finish(&self, execution_id: &str) {
        let removed = self
            .executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(execution_id);
        // Client went away mid-stream: stop the handler too
        if let Some(token) = removed {
            token.cancel();
        }
    }

    pub fn active(&self) -> usize {
        self.executions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Removes its execution from `PeerState` when the response stream is dropped.
pub struct ExecutionGuard {
    state: Arc<PeerState>,
    execution_id: String,
}

impl ExecutionGuard {
    pub fn new(state: Arc<PeerState>, execution_id: String) -> Self {
        Self {
            state,
            execution_id,
        }
    }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.state.finish(&self.execution_id);
    }
}
