//! DHT future module
//!
//! `DhtFuture<T>` represents one outstanding DHT operation. It can be
//! awaited by any number of clones, observed through listeners that run in
//! registration order when the outcome is set, and cancelled. The producing
//! side holds a `Completer<T>`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::error::{DhtError, Result};

type Listener<T> = Box<dyn FnOnce(&Result<T>) + Send + 'static>;
type CancelHook = Box<dyn FnOnce() + Send + 'static>;

struct State<T> {
    outcome: Option<Result<T>>,
    wakers: Vec<Waker>,
    listeners: Vec<Listener<T>>,
    cancel_hooks: Vec<CancelHook>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

impl<T: Clone> Shared<T> {
    /// Set the outcome once; later calls are ignored.
    fn finish(&self, result: Result<T>, cancelled: bool) -> bool {
        let (listeners, wakers, hooks) = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(result.clone());
            let hooks = std::mem::take(&mut state.cancel_hooks);
            (
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.wakers),
                hooks,
            )
        };

        if cancelled {
            for hook in hooks {
                hook();
            }
        }
        for listener in listeners {
            listener(&result);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

/// Handle to the outcome of an asynchronous DHT operation
pub struct DhtFuture<T> {
    shared: Arc<Shared<T>>,
}

/// Producer side of a `DhtFuture`
pub struct Completer<T: Clone> {
    shared: Arc<Shared<T>>,
}

impl<T: Clone + Send + 'static> DhtFuture<T> {
    /// Create a pending future and its completer
    pub fn new() -> (DhtFuture<T>, Completer<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                outcome: None,
                wakers: Vec::new(),
                listeners: Vec::new(),
                cancel_hooks: Vec::new(),
            }),
        });
        (
            DhtFuture {
                shared: shared.clone(),
            },
            Completer { shared },
        )
    }

    /// A future that is already done
    pub fn ready(result: Result<T>) -> Self {
        let (future, completer) = Self::new();
        completer.complete(result);
        future
    }

    /// Drive `task` on the tokio runtime. Cancelling the future aborts the task.
    pub fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (future, completer) = Self::new();
        let handle = tokio::spawn(async move {
            let result = task.await;
            completer.complete(result);
        });
        future.on_cancel(move || handle.abort());
        future
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.shared.state.lock().outcome, Some(Err(DhtError::Cancelled)))
    }

    /// The outcome, if already set
    pub fn try_result(&self) -> Option<Result<T>> {
        self.shared.state.lock().outcome.clone()
    }

    /// Complete with `DhtError::Cancelled` and run cancel hooks.
    /// Returns false if the future was already done.
    pub fn cancel(&self) -> bool {
        self.shared.finish(Err(DhtError::Cancelled), true)
    }

    /// Run `listener` with the outcome. Listeners run in registration order;
    /// on a finished future the listener runs immediately.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Result<T>) + Send + 'static,
    {
        let outcome = {
            let mut state = self.shared.state.lock();
            match &state.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    state.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(&outcome);
    }

    /// Run `hook` if the future is cancelled
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.outcome.is_none() {
            state.cancel_hooks.push(Box::new(hook));
        }
    }
}

impl<T> Clone for DhtFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for DhtFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let done = self.shared.state.lock().outcome.is_some();
        f.debug_struct("DhtFuture").field("done", &done).finish()
    }
}

impl<T: Clone> Future for DhtFuture<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T: Clone> Completer<T> {
    /// Set the outcome. Returns false if it was already set.
    pub fn complete(&self, result: Result<T>) -> bool {
        self.shared.finish(result, false)
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, error: DhtError) -> bool {
        self.complete(Err(error))
    }

    pub fn is_done(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }
}

impl<T: Clone> Drop for Completer<T> {
    fn drop(&mut self) {
        // an abandoned operation never leaves its awaiters hanging
        self.shared.finish(Err(DhtError::Cancelled), false);
    }
}
