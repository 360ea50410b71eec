use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use crate::error::{ConnectError, ConnectResult, HardwareErrorCode};

/// Read side of a request's cancellation token. Once set it never clears.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal nobody can ever trip.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn check(&self, code: HardwareErrorCode) -> ConnectResult<()> {
        if self.is_aborted() {
            return Err(ConnectError::new(code));
        }
        Ok(())
    }

    /// Resolves once aborted; pends forever for a signal that cannot trip.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

type Deferred = oneshot::Sender<ConnectResult<Value>>;

struct RequestTask {
    method: String,
    connect_id: Option<String>,
    abort: watch::Sender<bool>,
    deferred: Option<Deferred>,
}

/// Handle returned to the caller that created a task.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    pub id: u64,
    pub signal: AbortSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallbackState {
    Running,
    Done,
    Cancelled,
}

struct CallbackEntry {
    id: u64,
    state: Arc<watch::Sender<CallbackState>>,
}

/// A background operation bound to one connect id.
///
/// Dropping the task marks it done and releases anyone awaiting it.
pub struct CallbackTask {
    pub connect_id: String,
    state: Arc<watch::Sender<CallbackState>>,
}

impl CallbackTask {
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow() == CallbackState::Cancelled
    }
}

impl Drop for CallbackTask {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            if *state == CallbackState::Running {
                *state = CallbackState::Done;
                true
            } else {
                false
            }
        });
    }
}

/// Registry of in-flight calls and per-connection callback tasks.
#[derive(Default)]
pub struct RequestQueue {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, RequestTask>>,
    callbacks: Mutex<HashMap<String, CallbackEntry>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_task(
        &self,
        method: &str,
        connect_id: Option<&str>,
    ) -> (RequestHandle, oneshot::Receiver<ConnectResult<Value>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (abort, abort_rx) = watch::channel(false);
        let (deferred, rx) = oneshot::channel();
        self.tasks.lock().insert(
            id,
            RequestTask {
                method: method.to_string(),
                connect_id: connect_id.map(str::to_string),
                abort,
                deferred: Some(deferred),
            },
        );
        debug!(id, method, "request task created");
        (
            RequestHandle {
                id,
                signal: AbortSignal { rx: abort_rx },
            },
            rx,
        )
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.tasks.lock().contains_key(&id)
    }

    /// Binds a task to the device chosen after it was created.
    pub fn set_connect_id(&self, id: u64, connect_id: &str) {
        if let Some(task) = self.tasks.lock().get_mut(&id) {
            task.connect_id = Some(connect_id.to_string());
        }
    }

    pub fn request_ids_for_connect_id(&self, connect_id: &str) -> Vec<u64> {
        self.tasks
            .lock()
            .iter()
            .filter(|(_, task)| task.connect_id.as_deref() == Some(connect_id))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Signals cancellation; settling stays with whoever awaits the task.
    pub fn abort_request(&self, id: u64) -> bool {
        match self.tasks.lock().get(&id) {
            Some(task) => {
                task.abort.send_replace(true);
                debug!(id, method = %task.method, "request aborted");
                true
            }
            None => false,
        }
    }

    pub fn abort_requests_by_connect_id(&self, connect_id: &str) -> usize {
        let tasks = self.tasks.lock();
        let mut count = 0;
        for task in tasks
            .values()
            .filter(|task| task.connect_id.as_deref() == Some(connect_id))
        {
            task.abort.send_replace(true);
            count += 1;
        }
        count
    }

    pub fn abort_all_requests(&self) {
        for task in self.tasks.lock().values() {
            task.abort.send_replace(true);
        }
    }

    fn settle(&self, id: u64, result: ConnectResult<Value>) {
        let Some(mut task) = self.tasks.lock().remove(&id) else {
            return;
        };
        if let Some(deferred) = task.deferred.take() {
            let _ = deferred.send(result);
        }
    }

    pub fn resolve_request(&self, id: u64, value: Value) {
        self.settle(id, Ok(value));
    }

    pub fn reject_request(&self, id: u64, error: ConnectError) {
        self.settle(id, Err(error));
    }

    pub fn register_pending_callback_task(&self, connect_id: &str) -> CallbackTask {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, _) = watch::channel(CallbackState::Running);
        let state = Arc::new(tx);
        let previous = self.callbacks.lock().insert(
            connect_id.to_string(),
            CallbackEntry {
                id,
                state: state.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(connect_id, previous = previous.id, "callback task replaced");
        }
        CallbackTask {
            connect_id: connect_id.to_string(),
            state,
        }
    }

    pub fn has_pending_callback_task(&self, connect_id: &str) -> bool {
        self.callbacks
            .lock()
            .get(connect_id)
            .is_some_and(|entry| *entry.state.borrow() == CallbackState::Running)
    }

    /// Waits until the callback task for `connect_id` finished or was
    /// cancelled.
    pub async fn wait_for_pending_callback_tasks(&self, connect_id: &str) {
        let rx = {
            let callbacks = self.callbacks.lock();
            callbacks.get(connect_id).map(|entry| entry.state.subscribe())
        };
        let Some(mut rx) = rx else {
            return;
        };
        let _ = rx.wait_for(|state| *state != CallbackState::Running).await;
        let mut callbacks = self.callbacks.lock();
        if callbacks
            .get(connect_id)
            .is_some_and(|entry| *entry.state.borrow() != CallbackState::Running)
        {
            callbacks.remove(connect_id);
        }
    }

    /// Resolves the waiters early; the task itself keeps running and may
    /// observe [`CallbackTask::is_cancelled`].
    pub fn cancel_callback_tasks(&self, connect_id: Option<&str>) {
        let mut callbacks = self.callbacks.lock();
        let keys: Vec<String> = match connect_id {
            Some(connect_id) => callbacks
                .keys()
                .filter(|key| key.as_str() == connect_id)
                .cloned()
                .collect(),
            None => callbacks.keys().cloned().collect(),
        };
        for key in keys {
            if let Some(entry) = callbacks.remove(&key) {
                entry.state.send_if_modified(|state| {
                    if *state == CallbackState::Running {
                        *state = CallbackState::Cancelled;
                        true
                    } else {
                        false
                    }
                });
            }
        }
    }
}
