use crate::handler::{Completion, ReplyHandler, StepResult};
use crate::message::TxFrame;
use crate::transport::Link;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

type StepFuture = Pin<Box<dyn Future<Output = StepResult> + Send>>;
type StepFn = Box<dyn FnOnce() -> StepFuture + Send>;

enum Step {
    Task(StepFn),
    Send {
        frame: TxFrame,
        handler: Box<dyn ReplyHandler>,
    },
}

/// One-shot ordered executor for multi-step device intents.
///
/// Steps run strictly in order: step N+1 never starts before step N's result
/// is observed, and the first failure is returned verbatim with the remaining
/// steps skipped. A sequence produces its terminal result exactly once; on
/// success the result carries the message given at construction and the data
/// of the final step.
pub struct CommandSeq {
    link: Arc<Link>,
    success: String,
    steps: VecDeque<Step>,
}

impl CommandSeq {
    pub fn new(link: Arc<Link>, success: impl Into<String>) -> Self {
        Self {
            link,
            success: success.into(),
            steps: VecDeque::new(),
        }
    }

    /// Append an arbitrary async step. Closures capture whatever state they
    /// need from earlier steps.
    pub fn add_task<F, Fut>(&mut self, step: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        self.steps
            .push_back(Step::Task(Box::new(move || Box::pin(step()))));
    }

    /// Append a (message, handler) step. The handler's completion routes to
    /// the sequence; callers do not observe the individual step.
    pub fn add_msg(&mut self, frame: TxFrame, handler: Box<dyn ReplyHandler>) {
        self.steps.push_back(Step::Send { frame, handler });
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run the steps in order, short-circuiting on the first failure.
    pub async fn run(mut self) -> StepResult {
        let total = self.steps.len();
        let mut last_data = None;
        let mut index = 0usize;

        while let Some(step) = self.steps.pop_front() {
            index += 1;
            debug!(step = index, total, "running sequence step");
            let result = match step {
                Step::Task(step) => step().await,
                Step::Send { frame, handler } => self.link.request(frame, handler).await,
            };
            match result {
                Ok(done) => last_data = done.data,
                Err(err) => {
                    debug!(step = index, %err, "sequence aborted");
                    return Err(err);
                }
            }
        }

        Ok(Completion {
            message: Some(self.success),
            data: last_data,
        })
    }

    /// Fire-and-forget variant; `on_done` receives the terminal result
    /// exactly once.
    pub fn spawn(self, on_done: impl FnOnce(StepResult) + Send + 'static) {
        tokio::spawn(async move {
            on_done(self.run().await);
        });
    }
}
