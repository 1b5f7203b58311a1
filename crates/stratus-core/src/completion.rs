//! Single-use success/failure callbacks.
//!
//! Every asynchronous operation in Stratus resolves through a [`Completion`].
//! Resolution consumes the completion, so it cannot be resolved twice; a
//! completion that is dropped unresolved reports
//! [`CoreError::CompletionDropped`] to its callback instead of vanishing.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::CoreError;

type Callback<T> = Box<dyn FnOnce(Result<T, CoreError>) + Send + 'static>;

/// A single-use callback pair resolving one asynchronous operation.
///
/// The callback runs synchronously on the thread that resolves the
/// completion.
pub struct Completion<T: Send + 'static = ()> {
    name: String,
    callback: Option<Callback<T>>,
}

impl<T: Send + 'static> Completion<T> {
    /// Create a completion from separate success and failure handlers
    pub fn new<S, F>(name: impl Into<String>, on_success: S, on_fail: F) -> Self
    where
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(CoreError) + Send + 'static,
    {
        Self::from_fn(name, move |result| match result {
            Ok(value) => on_success(value),
            Err(err) => on_fail(err),
        })
    }

    /// Create a completion from a single handler receiving the outcome
    pub fn from_fn<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: FnOnce(Result<T, CoreError>) + Send + 'static,
    {
        Self {
            name: name.into(),
            callback: Some(Box::new(callback)),
        }
    }

    /// Create a completion whose outcome can be awaited through the receiver
    pub fn channel(name: impl Into<String>) -> (Self, CompletionReceiver<T>) {
        let name = name.into();
        let (tx, rx) = oneshot::channel();
        let completion = Self::from_fn(name.clone(), move |result| {
            // The receiver may have been dropped by an uninterested caller
            let _ = tx.send(result);
        });
        (completion, CompletionReceiver { name, rx })
    }

    /// A completion that only logs its outcome
    pub fn noop(name: impl Into<String>) -> Self {
        let name = name.into();
        let label = name.clone();
        Self::from_fn(name, move |result| match result {
            Ok(_) => debug!(completion = %label, "Operation succeeded"),
            Err(e) => warn!(completion = %label, error = %e, "Operation failed"),
        })
    }

    /// Name used when logging this completion
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve successfully with a value
    pub fn success_with(self, value: T) {
        self.resolve(Ok(value));
    }

    /// Resolve with an error
    pub fn fail(self, err: CoreError) {
        self.resolve(Err(err));
    }

    /// Resolve with the given outcome
    pub fn resolve(mut self, result: Result<T, CoreError>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    /// Run an asynchronous operation body and resolve with its outcome.
    ///
    /// Errors and panics raised by the body are both reported through
    /// [`Completion::fail`].
    pub async fn guard<F>(self, body: F)
    where
        F: Future<Output = Result<T, CoreError>>,
    {
        match AssertUnwindSafe(body).catch_unwind().await {
            Ok(result) => self.resolve(result),
            Err(payload) => {
                let err = CoreError::from_panic(payload);
                error!(completion = %self.name, error = %err, "Operation body panicked");
                self.fail(err);
            }
        }
    }

    /// Synchronous counterpart of [`Completion::guard`]
    pub fn guard_sync<F>(self, body: F)
    where
        F: FnOnce() -> Result<T, CoreError>,
    {
        match std::panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(result) => self.resolve(result),
            Err(payload) => {
                let err = CoreError::from_panic(payload);
                error!(completion = %self.name, error = %err, "Operation body panicked");
                self.fail(err);
            }
        }
    }
}

impl Completion<()> {
    /// Resolve successfully
    pub fn success(self) {
        self.success_with(());
    }
}

impl<T: Send + 'static> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            warn!(completion = %self.name, "Completion dropped without being resolved");
            callback(Err(CoreError::CompletionDropped(self.name.clone())));
        }
    }
}

impl<T: Send + 'static> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("name", &self.name)
            .field("resolved", &self.callback.is_none())
            .finish()
    }
}

/// Receiving half of [`Completion::channel`]
#[derive(Debug)]
pub struct CompletionReceiver<T> {
    name: String,
    rx: oneshot::Receiver<Result<T, CoreError>>,
}

impl<T> CompletionReceiver<T> {
    /// Wait for the completion to be resolved
    pub async fn wait(self) -> Result<T, CoreError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CoreError::CompletionDropped(self.name)),
        }
    }

    /// Block the current (non-async) thread until the completion is resolved
    pub fn blocking_wait(self) -> Result<T, CoreError> {
        match self.rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(CoreError::CompletionDropped(self.name)),
        }
    }
}
