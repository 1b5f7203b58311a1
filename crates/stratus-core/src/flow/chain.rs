use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::machine::{ChainAction, ChainMachine};
use super::trigger::{Signal, TriggerPhase, WeakTrigger};
use super::{Flow, FlowContext, FlowTrigger};
use crate::{Completion, CoreError};

type DoneHandler = Box<dyn FnOnce(&FlowContext) + Send>;
type ErrorHandler = Box<dyn FnOnce(&CoreError, &FlowContext) + Send>;
type FinallyHandler = Box<dyn FnOnce() + Send>;

/// An ordered sequence of [`Flow`] steps with terminal handlers.
///
/// ```ignore
/// let data = FlowChain::new("attach-volume")
///     .then(AllocateVolume::new(spec))
///     .then(AttachToHost::new(host))
///     .done(|ctx| info!("attached {:?}", ctx.get_value("volume")))
///     .error(|err, _| warn!("attach failed: {}", err))
///     .start()
///     .await?;
/// ```
///
/// Exactly one of the done or error handlers fires per execution, followed by
/// the finally handler. The step list cannot change once the chain starts.
pub struct FlowChain {
    id: Uuid,
    name: String,
    steps: Vec<Arc<dyn Flow>>,
    data: FlowContext,
    done: Option<DoneHandler>,
    error: Option<ErrorHandler>,
    finally: Option<FinallyHandler>,
    allow_empty: bool,
    pending: Arc<Mutex<Option<WeakTrigger>>>,
}

impl FlowChain {
    /// Create an empty chain
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            steps: Vec::new(),
            data: FlowContext::new(),
            done: None,
            error: None,
            finally: None,
            allow_empty: false,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Append a step
    pub fn then<F: Flow + 'static>(mut self, step: F) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Append an already shared step
    pub fn then_shared(mut self, step: Arc<dyn Flow>) -> Self {
        self.steps.push(step);
        self
    }

    /// Append several steps in order
    pub fn then_all<I>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Flow>>,
    {
        self.steps.extend(steps);
        self
    }

    /// Seed the execution context
    pub fn with_data(mut self, data: FlowContext) -> Self {
        self.data = data;
        self
    }

    /// Handler fired once when every step advanced
    pub fn done<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(&FlowContext) + Send + 'static,
    {
        self.done = Some(Box::new(handler));
        self
    }

    /// Handler fired once when the chain fails, after rollback
    pub fn error<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(&CoreError, &FlowContext) + Send + 'static,
    {
        self.error = Some(Box::new(handler));
        self
    }

    /// Handler fired once after the done or error handler
    pub fn finally<F>(mut self, handler: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.finally = Some(Box::new(handler));
        self
    }

    /// Whether a chain without steps may run (its done handler fires at once)
    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    /// Chain name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the chain has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Handle for aborting the step that is currently running forward
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            chain: self.name.clone(),
            pending: self.pending.clone(),
        }
    }

    /// Run the chain on a worker task
    pub fn spawn(self) -> JoinHandle<Result<FlowContext, CoreError>> {
        tokio::spawn(self.start())
    }

    /// Run the chain and resolve `completion` with its outcome
    pub async fn start_with(self, completion: Completion) {
        completion.resolve(self.start().await.map(|_| ()));
    }

    /// Run the chain on the calling task.
    ///
    /// Returns the final context on success, or the error that was also
    /// reported to the error handler.
    pub async fn start(self) -> Result<FlowContext, CoreError> {
        let FlowChain {
            id,
            name,
            steps,
            mut data,
            done,
            error,
            finally,
            allow_empty,
            pending,
        } = self;

        if steps.is_empty() && !allow_empty {
            return Err(CoreError::InvalidArgument(format!(
                "flow chain '{}' has no steps and empty chains are not allowed",
                name
            )));
        }

        info!(chain = %name, chain_id = %id, steps = steps.len(), "Starting flow chain");

        let mut machine = ChainMachine::new(steps.iter().map(|s| s.name().to_string()).collect());
        let mut action = machine.start();

        let outcome = loop {
            let next = match action {
                Ok(ChainAction::Run(index)) => {
                    let step = &steps[index];
                    match run_step(&name, index, step, &mut data, &pending).await {
                        Ok(()) => machine.on_next(),
                        Err(cause) => {
                            warn!(chain = %name, step = %step.name(), index, error = %cause, "Step failed, rolling back");
                            machine.on_fail(cause)
                        }
                    }
                }
                Ok(ChainAction::Rollback(index)) => {
                    let step = &steps[index];
                    match rollback_step(&name, index, step, &mut data).await {
                        Ok(()) => machine.on_rollback_done(),
                        Err(cause) => {
                            error!(chain = %name, step = %step.name(), index, error = %cause, "Compensation failed, halting rollback");
                            machine.on_rollback_failed(cause)
                        }
                    }
                }
                Ok(ChainAction::Done) => break Ok(()),
                Ok(ChainAction::Error(err)) => break Err(err),
                Err(err) => break Err(err),
            };
            action = next;
        };

        match &outcome {
            Ok(()) => {
                info!(chain = %name, chain_id = %id, "Flow chain completed");
                if let Some(handler) = done {
                    handler(&data);
                }
            }
            Err(err) => {
                warn!(chain = %name, chain_id = %id, error = %err, "Flow chain failed");
                if let Some(handler) = error {
                    handler(err, &data);
                }
            }
        }
        if let Some(handler) = finally {
            handler();
        }

        outcome.map(|_| data)
    }
}

async fn run_step(
    chain: &str,
    index: usize,
    step: &Arc<dyn Flow>,
    data: &mut FlowContext,
    pending: &Mutex<Option<WeakTrigger>>,
) -> Result<(), CoreError> {
    debug!(chain = %chain, step = %step.name(), index, "Running step");
    let (trigger, rx) = FlowTrigger::new(chain, step.name(), index, TriggerPhase::Run);
    *pending.lock() = Some(trigger.downgrade());

    let signal = await_signal(step.run(trigger, data), rx).await;
    *pending.lock() = None;

    match signal? {
        Signal::Next => Ok(()),
        Signal::Fail(cause) => Err(cause),
        other => Err(CoreError::ProtocolViolation(format!(
            "run trigger delivered {:?}",
            other
        ))),
    }
}

async fn rollback_step(
    chain: &str,
    index: usize,
    step: &Arc<dyn Flow>,
    data: &mut FlowContext,
) -> Result<(), CoreError> {
    debug!(chain = %chain, step = %step.name(), index, "Rolling back step");
    let (trigger, rx) = FlowTrigger::new(chain, step.name(), index, TriggerPhase::Rollback);

    match await_signal(step.rollback(trigger, data), rx).await? {
        Signal::RolledBack => Ok(()),
        Signal::RollbackFailed(cause) => Err(cause),
        other => Err(CoreError::ProtocolViolation(format!(
            "rollback trigger delivered {:?}",
            other
        ))),
    }
}

/// Drive a step body until its trigger fires.
///
/// A trigger that fires while the body is still pending ends the body early.
/// A body that returns leaves the chain suspended until some clone of the
/// trigger fires, or fails the step once every clone has been dropped.
async fn await_signal(
    body: BoxFuture<'_, ()>,
    mut rx: oneshot::Receiver<Signal>,
) -> Result<Signal, CoreError> {
    let body = AssertUnwindSafe(body).catch_unwind();
    tokio::pin!(body);

    tokio::select! {
        biased;
        signal = &mut rx => {
            return signal.map_err(|_| dropped_trigger());
        }
        outcome = &mut body => {
            if let Err(payload) = outcome {
                let panic = CoreError::from_panic(payload);
                return match rx.try_recv() {
                    Ok(signal) => {
                        warn!(error = %panic, "Step panicked after firing its trigger");
                        Ok(signal)
                    }
                    Err(_) => Err(panic),
                };
            }
        }
    }

    rx.await.map_err(|_| dropped_trigger())
}

fn dropped_trigger() -> CoreError {
    CoreError::ProtocolViolation("step dropped its trigger without firing it".to_string())
}

/// Aborts the forward step a chain is currently waiting on.
///
/// Cancelling fires the pending step's `fail()`, so the chain rolls back
/// normally. There is nothing to cancel while the chain is rolling back or
/// after it finished.
#[derive(Clone)]
pub struct CancelHandle {
    chain: String,
    pending: Arc<Mutex<Option<WeakTrigger>>>,
}

impl CancelHandle {
    /// Fail the pending forward step with `reason`
    pub fn cancel(&self, reason: CoreError) -> Result<(), CoreError> {
        let trigger = self.pending.lock().as_ref().and_then(WeakTrigger::upgrade);
        match trigger {
            Some(trigger) => {
                info!(chain = %self.chain, step = %trigger.step_name(), "Cancelling flow chain");
                trigger.fail(reason)
            }
            None => Err(CoreError::ProtocolViolation(format!(
                "chain '{}' has no forward step to cancel",
                self.chain
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FnFlow;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Flow for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self, trigger: FlowTrigger, _data: &mut FlowContext) {
            self.count.fetch_add(1, Ordering::SeqCst);
            trigger.next().unwrap();
        }
    }

    #[tokio::test]
    async fn test_ten_synchronous_steps_complete_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let done_calls = Arc::new(AtomicUsize::new(0));

        let mut chain = FlowChain::new("counter");
        for _ in 0..10 {
            chain = chain.then(Counting { count: count.clone() });
        }
        let done = done_calls.clone();
        let result = chain
            .done(move |_| {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .start()
            .await;

        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(done_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_chain_rejected_unless_allowed() {
        let result = FlowChain::new("empty").start().await;
        assert!(matches!(result, Err(CoreError::InvalidArgument(_))));

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let result = FlowChain::new("empty")
            .allow_empty(true)
            .done(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .start()
            .await;
        assert!(result.is_ok());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_context_flows_between_steps() {
        let data = FlowChain::new("ctx")
            .then(FnFlow::new("write", |ctx| ctx.put("ip", "10.0.0.7")))
            .then(FnFlow::new("read", |ctx| {
                let ip: String = ctx.get("ip")?.ok_or("ip missing")?;
                ctx.put("nic", format!("eth0@{}", ip))
            }))
            .start()
            .await
            .unwrap();

        assert_eq!(data.get_value("nic"), Some(&json!("eth0@10.0.0.7")));
    }

    struct Forgetful;

    #[async_trait]
    impl Flow for Forgetful {
        fn name(&self) -> &str {
            "forgetful"
        }

        async fn run(&self, _trigger: FlowTrigger, _data: &mut FlowContext) {}
    }

    #[tokio::test]
    async fn test_dropped_trigger_fails_step() {
        let result = FlowChain::new("forgetful").then(Forgetful).start().await;
        match result {
            Err(CoreError::StepFailure { step, cause, .. }) => {
                assert_eq!(step, "forgetful");
                assert!(matches!(*cause, CoreError::ProtocolViolation(_)));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    struct Panicking;

    #[async_trait]
    impl Flow for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn run(&self, _trigger: FlowTrigger, _data: &mut FlowContext) {
            panic!("agent returned garbage");
        }
    }

    #[tokio::test]
    async fn test_panicking_step_rolls_back_previous() {
        let undone = Arc::new(AtomicUsize::new(0));
        let u = undone.clone();
        let result = FlowChain::new("panic")
            .then(FnFlow::new("first", |_| Ok(())).with_rollback(move |_| {
                u.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .then(Panicking)
            .start()
            .await;

        let err = result.unwrap_err();
        assert_eq!(
            err.root_cause(),
            &CoreError::TaskPanicked("agent returned garbage".to_string())
        );
        assert_eq!(undone.load(Ordering::SeqCst), 1);
    }

    struct Hanging;

    #[async_trait]
    impl Flow for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn run(&self, trigger: FlowTrigger, _data: &mut FlowContext) {
            // Keep the trigger alive while waiting on a reply that never comes
            let _keep = trigger;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }

    #[tokio::test]
    async fn test_cancel_fails_pending_step() {
        let chain = FlowChain::new("cancellable").then(Hanging);
        let cancel = chain.cancel_handle();
        assert!(cancel.cancel(CoreError::external("too early")).is_err());

        let handle = chain.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel(CoreError::external("operator abort")).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.root_cause(), &CoreError::external("operator abort"));
        assert!(cancel.cancel(CoreError::external("again")).is_err());
    }

    #[tokio::test]
    async fn test_start_with_completion() {
        let (completion, receiver) = Completion::channel("chain");
        FlowChain::new("failing")
            .then(FnFlow::new("bad", |_| Err(CoreError::external("nope"))))
            .start_with(completion)
            .await;

        let err = receiver.wait().await.unwrap_err();
        assert!(matches!(err, CoreError::StepFailure { index: 0, .. }));
    }
}
