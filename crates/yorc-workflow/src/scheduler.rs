//! The activity scheduler (§4.6.4): an external collaborator the
//! executor registers an async action with. The engine itself never
//! polls; it blocks on a completion channel the scheduler fires once the
//! action settles, so a step legitimately stays `RUNNING` across
//! however many ticks the action takes.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

/// Identifies the activity being polled, so a resumed executor can
/// reattach to it (§4.6.4: "the registration record includes
/// `{deployment, task, execution, workflow, step, node, operation}`").
#[derive(Debug, Clone)]
pub struct AsyncActionRegistration {
    pub deployment: String,
    pub task: String,
    pub execution: String,
    pub workflow: String,
    pub step: String,
    pub node: String,
    pub operation: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncPollOutcome {
    Pending,
    Done,
    Failed(String),
}

/// One tick of an async operation. Implementations wrap whatever the
/// external driver uses to check progress (a job id, a poll URL, ...).
#[async_trait]
pub trait AsyncAction: Send + Sync {
    async fn poll(&self) -> AsyncPollOutcome;
}

/// Registers an async action for periodic polling and eventually
/// resolves `on_complete` with the terminal outcome.
#[async_trait]
pub trait ActivityScheduler: Send + Sync {
    async fn schedule(
        &self,
        registration: AsyncActionRegistration,
        interval: Duration,
        action: Box<dyn AsyncAction>,
        on_complete: oneshot::Sender<Result<(), String>>,
    );
}

/// A real scheduler: ticks `action.poll()` on a `tokio::time::interval`
/// until it settles. Suitable for single-node runs; nothing here is
/// specific to the in-memory store.
#[derive(Default)]
pub struct TickingScheduler;

impl TickingScheduler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ActivityScheduler for TickingScheduler {
    async fn schedule(
        &self,
        registration: AsyncActionRegistration,
        interval: Duration,
        action: Box<dyn AsyncAction>,
        on_complete: oneshot::Sender<Result<(), String>>,
    ) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; skip it so the first real poll
            // happens after one full interval, matching "registers the
            // action... for periodic polling" rather than polling at t=0.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match action.poll().await {
                    AsyncPollOutcome::Pending => continue,
                    AsyncPollOutcome::Done => {
                        tracing::debug!(
                            deployment = %registration.deployment,
                            task = %registration.task,
                            step = %registration.step,
                            operation = %registration.operation,
                            "async operation completed"
                        );
                        let _ = on_complete.send(Ok(()));
                        return;
                    }
                    AsyncPollOutcome::Failed(reason) => {
                        let _ = on_complete.send(Err(reason));
                        return;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingAction {
        ticks_until_done: u32,
        seen: Arc<AtomicU32>,
    }

    #[async_trait]
    impl AsyncAction for CountingAction {
        async fn poll(&self) -> AsyncPollOutcome {
            let n = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.ticks_until_done {
                AsyncPollOutcome::Done
            } else {
                AsyncPollOutcome::Pending
            }
        }
    }

    #[tokio::test]
    async fn resolves_only_after_required_ticks() {
        let seen = Arc::new(AtomicU32::new(0));
        let action = Box::new(CountingAction {
            ticks_until_done: 3,
            seen: seen.clone(),
        });
        let scheduler = TickingScheduler::new();
        let (tx, rx) = oneshot::channel();
        scheduler
            .schedule(
                AsyncActionRegistration {
                    deployment: "dep1".into(),
                    task: "task1".into(),
                    execution: "exec1".into(),
                    workflow: "install".into(),
                    step: "configure".into(),
                    node: "App".into(),
                    operation: "install".into(),
                },
                Duration::from_millis(10),
                action,
                tx,
            )
            .await;
        rx.await.unwrap().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
