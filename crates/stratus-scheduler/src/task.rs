use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use stratus_core::CoreError;

/// A unit of work serialized by signature.
///
/// Implementors carry everything the body needs as fields, so concurrent
/// submissions never share mutable state through a closure.
#[async_trait]
pub trait SyncTask: Send + Sized + 'static {
    /// Value produced by the task body
    type Output: Send + 'static;

    /// Serialization key; tasks with equal signatures never overlap
    fn sync_signature(&self) -> &str;

    /// Priority among waiters for the same signature
    fn sync_level(&self) -> i32 {
        0
    }

    /// Name used in logs
    fn name(&self) -> &str {
        self.sync_signature()
    }

    /// Task body
    async fn call(self) -> Result<Self::Output, CoreError>;
}

/// Builder for an ad hoc [`SyncTask`] around a future.
///
/// ```ignore
/// let task = TaskSpec::new(format!("deploy-to-host-{}", ip))
///     .level(1)
///     .name("install-agent")
///     .body(async move { install(&ip).await });
/// scheduler.submit(task).await?;
/// ```
#[derive(Debug, Clone)]
pub struct TaskSpec {
    signature: String,
    level: i32,
    name: Option<String>,
}

impl TaskSpec {
    /// Start a task under `signature` at level 0
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            level: 0,
            name: None,
        }
    }

    /// Set the level
    pub fn level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Set the log name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach the body, producing a submittable task
    pub fn body<F, T>(self, body: F) -> BodyTask<T>
    where
        F: Future<Output = Result<T, CoreError>> + Send + 'static,
        T: Send + 'static,
    {
        BodyTask {
            name: self.name.unwrap_or_else(|| self.signature.clone()),
            signature: self.signature,
            level: self.level,
            body: body.boxed(),
        }
    }
}

/// A [`TaskSpec`] with its body attached
pub struct BodyTask<T> {
    signature: String,
    level: i32,
    name: String,
    body: BoxFuture<'static, Result<T, CoreError>>,
}

impl<T> fmt::Debug for BodyTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyTask")
            .field("signature", &self.signature)
            .field("level", &self.level)
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<T: Send + 'static> SyncTask for BodyTask<T> {
    type Output = T;

    fn sync_signature(&self) -> &str {
        &self.signature
    }

    fn sync_level(&self) -> i32 {
        self.level
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn call(self) -> Result<T, CoreError> {
        self.body.await
    }
}
