//! The worker thread that executes one pipeline run.

use std::any::Any;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::context::RequestContext;
use crate::models::{ChatInput, FinalResult};
use crate::traits::Pipeline;

use super::listener::GenerationListener;
use super::relay::{RelayItem, RelaySender, RunId};

/// Terminal state of a background run.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed(FinalResult),
    Failed(anyhow::Error),
}

impl TaskOutcome {
    pub fn result(&self) -> Option<&FinalResult> {
        match self {
            TaskOutcome::Completed(r) => Some(r),
            TaskOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        match self {
            TaskOutcome::Completed(_) => None,
            TaskOutcome::Failed(e) => Some(e),
        }
    }
}

/// Pushes the outer run's terminal marker when dropped, which happens on
/// normal return, on error, and while unwinding from a panic.
struct EndMarkerGuard {
    sender: RelaySender,
    run_id: RunId,
}

impl Drop for EndMarkerGuard {
    fn drop(&mut self) {
        self.sender.push(RelayItem::End(self.run_id));
    }
}

/// Handle to a running pipeline thread.
pub struct BackgroundTask {
    run_id: RunId,
    handle: JoinHandle<TaskOutcome>,
}

impl BackgroundTask {
    /// Starts `pipeline` on a new OS thread.
    ///
    /// `context`, when given, is installed on the new thread before the
    /// pipeline runs. The `End(run_id)` marker is pushed on `sender` however
    /// the run terminates.
    pub fn spawn<L>(
        pipeline: Arc<dyn Pipeline>,
        input: ChatInput,
        mut listener: L,
        sender: RelaySender,
        run_id: RunId,
        context: Option<Arc<RequestContext>>,
    ) -> std::io::Result<Self>
    where
        L: GenerationListener + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(format!("chat-stream-{}", short_id(run_id)))
            .spawn(move || {
                let _end = EndMarkerGuard { sender, run_id };
                let _context = context.as_ref().map(|c| c.install());

                tracing::debug!(%run_id, "pipeline run started");
                match pipeline.run(&input, &mut listener) {
                    Ok(result) => {
                        tracing::debug!(%run_id, answer_len = result.answer.len(), "pipeline run completed");
                        TaskOutcome::Completed(result)
                    }
                    Err(e) => {
                        tracing::error!(%run_id, error = %e, "pipeline run failed");
                        TaskOutcome::Failed(e)
                    }
                }
            })?;

        Ok(Self { run_id, handle })
    }

    /// Waits for the thread to exit. A panic inside the pipeline becomes
    /// [`TaskOutcome::Failed`].
    pub fn join(self) -> TaskOutcome {
        let run_id = self.run_id;
        match self.handle.join() {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(%run_id, panic = %message, "pipeline thread panicked");
                TaskOutcome::Failed(anyhow::anyhow!("pipeline panicked: {}", message))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn short_id(run_id: RunId) -> String {
    run_id.to_string().chars().take(8).collect()
}
