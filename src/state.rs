//! State manager (C14): a FIFO of named boot steps, each either awaited
//! before the next dequeues or launched as a detached background task, plus
//! the aggregated exit stack every long-lived resource registers cleanup on
//! (spec.md §4.14).
//!
//! Grounded on the `shutdown_signal` shape in
//! `alissonlinneker-nova-protocol/node/src/main.rs` (ctrl_c + SIGTERM race),
//! widened to also catch a second Ctrl+C during an in-progress shutdown and
//! propagate that as hard cancellation.

use std::future::Future;
use std::pin::Pin;

use tokio::signal;

type CleanupFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;
type StepFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

struct Step {
    name: &'static str,
    is_blocking: bool,
    run: StepFn,
}

/// A FIFO of named boot steps. Blocking steps run to completion before the
/// next one starts; non-blocking steps are spawned and their join handle is
/// registered on the exit stack so shutdown still waits for them to unwind.
#[derive(Default)]
pub struct StateManager {
    steps: Vec<Step>,
    exit_stack: ExitStack,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a blocking step: the manager awaits it before dequeuing the
    /// next (spec.md §4.14 "the manager awaits completion before dequeuing").
    pub fn push_blocking<F, Fut>(&mut self, name: &'static str, step: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push(Step {
            name,
            is_blocking: true,
            run: Box::new(move || Box::pin(step())),
        });
    }

    /// Queue a non-blocking step: launched as a detached task tied to the
    /// exit stack (spec.md §4.14 "launched as a detached background task
    /// tied to the process exit stack").
    pub fn push_background<F, Fut>(&mut self, name: &'static str, step: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push(Step {
            name,
            is_blocking: false,
            run: Box::new(move || Box::pin(step())),
        });
    }

    /// Run every queued step in order. Blocking steps run and complete
    /// before the FIFO advances; non-blocking steps are spawned immediately
    /// and their handle registered on the exit stack so a later `shutdown`
    /// still unwinds them.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        for step in self.steps.drain(..) {
            if step.is_blocking {
                tracing::info!(name = step.name, "running blocking boot step");
                (step.run)().await?;
            } else {
                tracing::info!(name = step.name, "launching background boot step");
                let name = step.name;
                let handle = tokio::spawn(async move { (step.run)().await });
                self.exit_stack.push(move || {
                    Box::pin(async move {
                        handle.abort();
                        match handle.await {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(err)) => Err(err),
                            Err(join_err) if join_err.is_cancelled() => Ok(()),
                            Err(join_err) => Err(anyhow::anyhow!("step {name} panicked: {join_err}")),
                        }
                    })
                });
            }
        }
        Ok(())
    }

    pub fn exit_stack_mut(&mut self) -> &mut ExitStack {
        &mut self.exit_stack
    }

    /// Block until SIGINT/SIGTERM, then unwind the exit stack LIFO. A second
    /// Ctrl+C received while cleanups are still running aborts the wait
    /// instead of letting a stuck cleanup hang the whole shutdown forever
    /// (spec.md §4.14: "a subsequent Ctrl+C propagates cancellation into
    /// tasks").
    pub async fn run_until_shutdown(mut self) -> anyhow::Result<()> {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, finalizing");

        tokio::select! {
            result = self.exit_stack.unwind() => result,
            _ = signal::ctrl_c() => {
                tracing::warn!("second interrupt received, cancelling remaining cleanup");
                Err(anyhow::anyhow!("shutdown forced by a second interrupt"))
            }
        }
    }
}

/// LIFO stack of cleanup actions. Every cleanup runs even if an earlier one
/// fails; failures are collected into one aggregate error rather than
/// swallowed or short-circuited (spec.md §4.14).
#[derive(Default)]
pub struct ExitStack {
    cleanups: Vec<CleanupFn>,
}

impl ExitStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&mut self, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.cleanups.push(Box::new(move || Box::pin(cleanup())));
    }

    /// Run every registered cleanup, most-recently-pushed first, collecting
    /// any failures into a single aggregate error.
    pub async fn unwind(&mut self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        for cleanup in self.cleanups.drain(..).rev() {
            if let Err(err) = cleanup().await {
                errors.push(err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            let joined = errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
            Err(anyhow::anyhow!("{} cleanup task(s) failed: {joined}", errors.len()))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn blocking_steps_run_in_order_before_the_next_is_queued() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut manager = StateManager::new();

        let o1 = order.clone();
        manager.push_blocking("first", move || async move {
            o1.lock().unwrap().push(1);
            Ok(())
        });
        let o2 = order.clone();
        manager.push_blocking("second", move || async move {
            o2.lock().unwrap().push(2);
            Ok(())
        });

        manager.run().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn background_step_failure_is_collected_on_unwind() {
        let mut manager = StateManager::new();
        manager.push_background("doomed", || async move { anyhow::bail!("boom") });
        manager.run().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let result = manager.exit_stack_mut().unwind().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn exit_stack_unwinds_lifo() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stack = ExitStack::new();

        let o1 = order.clone();
        stack.push(move || async move {
            o1.lock().unwrap().push("first-pushed");
            Ok(())
        });
        let o2 = order.clone();
        stack.push(move || async move {
            o2.lock().unwrap().push("second-pushed");
            Ok(())
        });

        stack.unwind().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["second-pushed", "first-pushed"]);
    }

    #[tokio::test]
    async fn unwind_keeps_going_after_a_failure_and_reports_it() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut stack = ExitStack::new();
        stack.push(|| async move { anyhow::bail!("first cleanup failed") });
        let r = ran.clone();
        stack.push(move || async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let result = stack.unwind().await;
        assert!(result.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
