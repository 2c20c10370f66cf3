//! ---
//! sfeed_section: "02-messaging-dispatch"
//! sfeed_subsection: "module"
//! sfeed_type: "source"
//! sfeed_scope: "code"
//! sfeed_description: "Event model, completion handles, and sink clients."
//! sfeed_version: "v0.1.0"
//! sfeed_owner: "tbd"
//! ---
//! One-shot completion handles for asynchronous dispatches.
//!
//! A sink hands out a [`CompletionHandle`] per dispatch and keeps the matching
//! [`Completer`]. The completer resolves exactly once from whatever context the
//! sink completes on; every callback registered against the handle runs once,
//! in registration order, with the shared result.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{DispatchError, DispatchResult};

type Callback = Box<dyn FnOnce(&DispatchResult) + Send + 'static>;

enum State {
    Pending(Vec<Callback>),
    /// The resolver is running callbacks; registrations made meanwhile queue in `late`.
    Draining {
        result: DispatchResult,
        late: Vec<Callback>,
    },
    Resolved(DispatchResult),
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn resolve(&self, result: DispatchResult) {
        let mut batch = {
            let mut state = self.state.lock();
            match std::mem::replace(
                &mut *state,
                State::Draining {
                    result: result.clone(),
                    late: Vec::new(),
                },
            ) {
                State::Pending(callbacks) => callbacks,
                previous => {
                    *state = previous;
                    return;
                }
            }
        };

        loop {
            for callback in batch.drain(..) {
                callback(&result);
            }
            let mut state = self.state.lock();
            if let State::Draining { late, .. } = &mut *state {
                if !late.is_empty() {
                    batch = std::mem::take(late);
                    continue;
                }
            }
            *state = State::Resolved(result);
            return;
        }
    }
}

/// Consumer side of a dispatch completion. Cheap to clone.
#[derive(Clone)]
pub struct CompletionHandle {
    shared: Arc<Shared>,
}

/// Producer side of a dispatch completion, held by the sink.
pub struct Completer {
    shared: Option<Arc<Shared>>,
}

/// Create a linked completer/handle pair.
pub fn completion_pair() -> (Completer, CompletionHandle) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending(Vec::new())),
    });
    (
        Completer {
            shared: Some(shared.clone()),
        },
        CompletionHandle { shared },
    )
}

impl Completer {
    /// Resolve the dispatch and run all registered callbacks on the calling thread.
    pub fn resolve(mut self, result: DispatchResult) {
        if let Some(shared) = self.shared.take() {
            shared.resolve(result);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.resolve(Err(DispatchError::Abandoned));
        }
    }
}

impl std::fmt::Debug for Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer").finish_non_exhaustive()
    }
}

impl CompletionHandle {
    /// A handle that is already resolved, e.g. for dispatches rejected up front.
    pub fn resolved(result: DispatchResult) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Resolved(result)),
            }),
        }
    }

    /// Register a one-shot callback.
    ///
    /// Runs immediately on the caller when the handle is already resolved,
    /// otherwise on the context that resolves it.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&DispatchResult) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        let result = match &mut *state {
            State::Pending(callbacks) => {
                callbacks.push(Box::new(callback));
                return;
            }
            State::Draining { late, .. } => {
                late.push(Box::new(callback));
                return;
            }
            State::Resolved(result) => result.clone(),
        };
        drop(state);
        callback(&result);
    }

    /// Whether a result has been reported.
    pub fn is_resolved(&self) -> bool {
        !matches!(&*self.shared.state.lock(), State::Pending(_))
    }

    /// The reported result, if any.
    pub fn result(&self) -> Option<DispatchResult> {
        match &*self.shared.state.lock() {
            State::Pending(_) => None,
            State::Draining { result, .. } | State::Resolved(result) => Some(result.clone()),
        }
    }

    /// Wait asynchronously for the result.
    pub async fn wait(&self) -> DispatchResult {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.on_complete(move |result| {
            let _ = tx.send(result.clone());
        });
        rx.await.unwrap_or(Err(DispatchError::Abandoned))
    }
}

impl std::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
