use crate::address::Address;
use crate::handler::{
    ActiveRequest, CommandError, CompletionSender, DispatchOutcome, HandlerRegistry,
    ReplyHandler, StepResult, TimeoutOutcome,
};
use crate::message::{RxFrame, TxFrame};
use heapless::Deque;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Upper bound on queued sends per device. Battery devices accumulate writes
/// while asleep; anything past this fails fast instead of growing unbounded.
pub const MAX_PENDING_SENDS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("frame sink error: {0}")]
pub struct SinkError(pub String);

/// Write half of the PLM transport. The serial framing layer implements this;
/// tests substitute a recording sink.
pub trait FrameSink: Send + Sync {
    fn write_frame(&self, frame: &TxFrame) -> Result<(), SinkError>;
}

/// Device-scoped inbound intercept. Returns true when the frame is consumed.
pub type Watcher = Box<dyn Fn(&RxFrame) -> bool + Send + Sync>;

/// Fired every time a frame for the device is dispatched off its queue.
pub type WakeHook = Arc<dyn Fn() + Send + Sync>;

struct Pending {
    frame: TxFrame,
    handler: Box<dyn ReplyHandler>,
    done: CompletionSender,
}

/// Shared send/receive plumbing between the devices and the PLM.
///
/// Outbound frames go through a per-device FIFO with at most one request in
/// flight per device; inbound frames are offered to the active handler first,
/// then to any registered watchers.
pub struct Link {
    sink: Box<dyn FrameSink>,
    registry: HandlerRegistry,
    queues: Mutex<HashMap<Address, Deque<Pending, MAX_PENDING_SENDS>>>,
    watchers: Mutex<HashMap<Address, Vec<Watcher>>>,
    wake_hooks: Mutex<HashMap<Address, WakeHook>>,
}

impl Link {
    pub fn new(sink: Box<dyn FrameSink>) -> Arc<Self> {
        Arc::new(Self {
            sink,
            registry: HandlerRegistry::new(),
            queues: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            wake_hooks: Mutex::new(HashMap::new()),
        })
    }

    /// Queue a frame for its device. Replies are routed to the handler until
    /// it completes; the returned channel yields the terminal result.
    pub fn send(
        &self,
        frame: TxFrame,
        handler: Box<dyn ReplyHandler>,
    ) -> oneshot::Receiver<StepResult> {
        let (tx, rx) = oneshot::channel();
        let done = CompletionSender::new(tx);
        let addr = frame.to;
        let retries = handler.retry_budget();
        let pending = Pending {
            frame,
            handler,
            done,
        };

        let activated = {
            let mut queues = crate::lock(&self.queues);
            if self.registry.is_busy(addr) {
                let queue = queues.entry(addr).or_insert_with(Deque::new);
                if let Err(pending) = queue.push_back(pending) {
                    pending.done.resolve(Err(CommandError::QueueFull));
                }
                None
            } else {
                self.activate(addr, pending, retries)
            }
        };

        if let Some(Activated::Written(Some(hook))) = activated {
            hook();
        }
        rx
    }

    /// Awaitable form of [`Link::send`].
    pub async fn request(
        &self,
        frame: TxFrame,
        handler: Box<dyn ReplyHandler>,
    ) -> StepResult {
        match self.send(frame, handler).await {
            Ok(result) => result,
            Err(_) => Err(CommandError::LinkClosed),
        }
    }

    /// Inbound frame entry point for the transport driver. Returns true when
    /// the frame was consumed by a handler or a watcher.
    pub fn process(&self, frame: &RxFrame) -> bool {
        match self.registry.dispatch(frame) {
            DispatchOutcome::Finished => {
                trace!(device = %frame.from, "request finished");
                self.advance(frame.from);
                true
            }
            DispatchOutcome::Consumed => true,
            DispatchOutcome::NoHandler => {
                let watchers = crate::lock(&self.watchers);
                match watchers.get(&frame.from) {
                    Some(list) => list.iter().any(|watcher| watcher(frame)),
                    None => false,
                }
            }
        }
    }

    /// The transport's ACK window elapsed without a reply. Consumes one retry
    /// from the active handler's budget or fails the request.
    pub fn notify_send_timeout(&self, addr: Address) {
        match self.registry.timeout(addr) {
            TimeoutOutcome::Idle => {}
            TimeoutOutcome::Retry(frame) => {
                debug!(device = %addr, "send timeout, retrying");
                if let Err(err) = self.sink.write_frame(&frame) {
                    warn!(device = %addr, %err, "retry write failed");
                    self.registry.abort(addr, CommandError::SendFailed(err.0));
                    self.advance(addr);
                }
            }
            TimeoutOutcome::Exhausted => {
                debug!(device = %addr, "send timeout, retries exhausted");
                self.advance(addr);
            }
        }
    }

    /// Register a device-scoped intercept for frames the active handler does
    /// not claim (direct status reports, pairing traffic).
    pub fn add_watcher(
        &self,
        addr: Address,
        watcher: impl Fn(&RxFrame) -> bool + Send + Sync + 'static,
    ) {
        crate::lock(&self.watchers)
            .entry(addr)
            .or_default()
            .push(Box::new(watcher));
    }

    /// Register the dequeue hook for a device. Battery devices use this to
    /// piggyback housekeeping on traffic that is already flowing.
    pub fn set_wake_hook(&self, addr: Address, hook: WakeHook) {
        crate::lock(&self.wake_hooks).insert(addr, hook);
    }

    /// Dispatch the next queued frame for a device, if any.
    fn advance(&self, addr: Address) {
        loop {
            let activated = {
                let mut queues = crate::lock(&self.queues);
                let Some(queue) = queues.get_mut(&addr) else {
                    return;
                };
                // A competing send may have activated while the queue lock
                // was released; it owns the next advance.
                if self.registry.is_busy(addr) {
                    return;
                }
                let Some(pending) = queue.pop_front() else {
                    return;
                };
                let retries = pending.handler.retry_budget();
                self.activate(addr, pending, retries)
            };

            match activated {
                Some(Activated::Written(hook)) => {
                    if let Some(hook) = hook {
                        hook();
                    }
                    return;
                }
                Some(Activated::WriteFailed) => continue,
                None => return,
            }
        }
    }

    /// Install the request in the registry and write its frame. Must be
    /// called with the queue lock held; the returned hook runs after locks
    /// are released.
    fn activate(
        &self,
        addr: Address,
        pending: Pending,
        retries: u8,
    ) -> Option<Activated> {
        let request = ActiveRequest {
            frame: pending.frame.clone(),
            handler: pending.handler,
            done: pending.done,
            retries_left: retries,
        };
        if let Err(request) = self.registry.begin(addr, request) {
            request.done.resolve(Err(CommandError::QueueFull));
            return None;
        }

        if let Err(err) = self.sink.write_frame(&pending.frame) {
            warn!(device = %addr, %err, "frame write failed");
            self.registry.abort(addr, CommandError::SendFailed(err.0));
            return Some(Activated::WriteFailed);
        }

        let hook = crate::lock(&self.wake_hooks).get(&addr).cloned();
        Some(Activated::Written(hook))
    }

}

enum Activated {
    Written(Option<WakeHook>),
    WriteFailed,
}
