use crate::address::Address;
use crate::message::{MsgKind, NakReason, RxFrame, TxFrame};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

/// Successful completion payload handed back through the pipeline.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Completion {
    pub message: Option<String>,
    pub data: Option<Value>,
}

impl Completion {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            data: None,
        }
    }

    pub fn with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            message: Some(message.into()),
            data: Some(data),
        }
    }
}

/// Outcome of one protocol operation.
pub type StepResult = Result<Completion, CommandError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("invalid value for {field}: {value}")]
    InvalidArgument { field: String, value: String },

    #[error("missing required argument: {0}")]
    MissingArgument(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{0}")]
    Failed(String),

    #[error("device NAK: {0}")]
    Nak(NakReason),

    #[error("no reply from device")]
    Timeout,

    #[error("Wrong direct ack received")]
    UnexpectedReply,

    #[error("device send queue full")]
    QueueFull,

    #[error("frame write failed: {0}")]
    SendFailed(String),

    #[error("link closed before completion")]
    LinkClosed,
}

/// What a handler decided about one inbound frame.
pub enum Disposition {
    /// Not for this request; offer the frame elsewhere.
    Unrelated,
    /// Consumed, but the request is still in flight.
    Continue,
    /// The request is over; unregister the handler.
    Done(StepResult),
}

/// Per-request reply consumer. One handler accompanies each outbound frame
/// and sees every inbound frame from that device until it completes.
pub trait ReplyHandler: Send {
    fn on_reply(&mut self, frame: &RxFrame) -> Disposition;

    /// Resend attempts granted when the transport reports a send timeout.
    fn retry_budget(&self) -> u8 {
        0
    }
}

pub type AckFn = Box<dyn FnMut(&RxFrame) -> StepResult + Send>;

/// Waits for a standard-size direct ACK/NAK echoing the sent cmd1.
pub struct StandardCmd {
    cmd1: u8,
    ack: AckFn,
    num_retry: u8,
}

impl StandardCmd {
    pub fn new(cmd1: u8, ack: impl FnMut(&RxFrame) -> StepResult + Send + 'static) -> Self {
        Self::with_retries(cmd1, ack, 0)
    }

    pub fn with_retries(
        cmd1: u8,
        ack: impl FnMut(&RxFrame) -> StepResult + Send + 'static,
        num_retry: u8,
    ) -> Self {
        Self {
            cmd1,
            ack: Box::new(ack),
            num_retry,
        }
    }
}

impl ReplyHandler for StandardCmd {
    fn on_reply(&mut self, frame: &RxFrame) -> Disposition {
        if frame.flags.is_extended() {
            return Disposition::Unrelated;
        }
        match frame.flags.kind() {
            MsgKind::DirectNak => Disposition::Done(Err(CommandError::Nak(frame.nak_reason()))),
            MsgKind::DirectAck if frame.cmd1 == self.cmd1 => {
                Disposition::Done((self.ack)(frame))
            }
            MsgKind::DirectAck => {
                warn!(
                    expected = self.cmd1,
                    received = frame.cmd1,
                    "direct ack for a different command"
                );
                Disposition::Done(Err(CommandError::UnexpectedReply))
            }
            _ => Disposition::Unrelated,
        }
    }

    fn retry_budget(&self) -> u8 {
        self.num_retry
    }
}

/// Waits for the send-ACK and then for an extended direct message from the
/// same address carrying the response payload.
pub struct ExtendedCmdResponse {
    cmd1: u8,
    parse: AckFn,
    num_retry: u8,
    got_ack: bool,
}

impl ExtendedCmdResponse {
    pub fn new(cmd1: u8, parse: impl FnMut(&RxFrame) -> StepResult + Send + 'static) -> Self {
        Self::with_retries(cmd1, parse, 0)
    }

    pub fn with_retries(
        cmd1: u8,
        parse: impl FnMut(&RxFrame) -> StepResult + Send + 'static,
        num_retry: u8,
    ) -> Self {
        Self {
            cmd1,
            parse: Box::new(parse),
            num_retry,
            got_ack: false,
        }
    }
}

impl ReplyHandler for ExtendedCmdResponse {
    fn on_reply(&mut self, frame: &RxFrame) -> Disposition {
        if !self.got_ack {
            if frame.flags.is_extended() {
                return Disposition::Unrelated;
            }
            return match frame.flags.kind() {
                MsgKind::DirectNak => {
                    Disposition::Done(Err(CommandError::Nak(frame.nak_reason())))
                }
                MsgKind::DirectAck if frame.cmd1 == self.cmd1 => {
                    self.got_ack = true;
                    Disposition::Continue
                }
                MsgKind::DirectAck => Disposition::Done(Err(CommandError::UnexpectedReply)),
                _ => Disposition::Unrelated,
            };
        }

        if frame.flags.is_extended() && frame.flags.kind() == MsgKind::Direct {
            return Disposition::Done((self.parse)(frame));
        }
        Disposition::Unrelated
    }

    fn retry_budget(&self) -> u8 {
        self.num_retry
    }
}

/// One-shot completion channel. Resolving consumes the sender, so a result
/// can only ever be delivered once.
#[derive(Debug)]
pub struct CompletionSender(Option<oneshot::Sender<StepResult>>);

impl CompletionSender {
    pub fn new(tx: oneshot::Sender<StepResult>) -> Self {
        Self(Some(tx))
    }

    pub fn resolve(mut self, result: StepResult) {
        if let Some(tx) = self.0.take() {
            // The receiver may already be gone; nothing left to notify then.
            let _ = tx.send(result);
        }
    }
}

/// An in-flight request: the frame (kept for resends), its reply handler,
/// the completion channel, and the remaining retry budget.
pub struct ActiveRequest {
    pub frame: TxFrame,
    pub handler: Box<dyn ReplyHandler>,
    pub done: CompletionSender,
    pub retries_left: u8,
}

/// Outcome of offering an inbound frame to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No active handler claimed the frame.
    NoHandler,
    /// Consumed; the request is still waiting for more.
    Consumed,
    /// The request completed and its handler was unregistered.
    Finished,
}

/// Outcome of a send-timeout notification.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutOutcome {
    /// No request in flight for that device.
    Idle,
    /// Budget remains; the frame should be written again.
    Retry(TxFrame),
    /// Budget exhausted; the request completed with a timeout failure.
    Exhausted,
}

/// Active per-request handlers, at most one per device address.
pub struct HandlerRegistry {
    active: Mutex<HashMap<Address, ActiveRequest>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Register an in-flight request. Returns the request back if the device
    /// already has one outstanding.
    pub fn begin(&self, addr: Address, request: ActiveRequest) -> Result<(), ActiveRequest> {
        let mut active = crate::lock(&self.active);
        if active.contains_key(&addr) {
            return Err(request);
        }
        active.insert(addr, request);
        Ok(())
    }

    pub fn is_busy(&self, addr: Address) -> bool {
        crate::lock(&self.active).contains_key(&addr)
    }

    /// Offer an inbound frame to the active handler for its source address.
    /// Handler callbacks (and the signals they emit) run synchronously here.
    pub fn dispatch(&self, frame: &RxFrame) -> DispatchOutcome {
        let finished = {
            let mut active = crate::lock(&self.active);
            let Some(mut request) = active.remove(&frame.from) else {
                return DispatchOutcome::NoHandler;
            };
            match request.handler.on_reply(frame) {
                Disposition::Unrelated => {
                    active.insert(frame.from, request);
                    return DispatchOutcome::NoHandler;
                }
                Disposition::Continue => {
                    active.insert(frame.from, request);
                    return DispatchOutcome::Consumed;
                }
                Disposition::Done(result) => (request.done, result),
            }
        };

        let (done, result) = finished;
        done.resolve(result);
        DispatchOutcome::Finished
    }

    /// Apply the retry budget after the transport reports a send timeout.
    pub fn timeout(&self, addr: Address) -> TimeoutOutcome {
        let mut active = crate::lock(&self.active);
        let retry = match active.get_mut(&addr) {
            None => return TimeoutOutcome::Idle,
            Some(request) if request.retries_left > 0 => {
                request.retries_left -= 1;
                Some(request.frame.clone())
            }
            Some(_) => None,
        };

        match retry {
            Some(frame) => TimeoutOutcome::Retry(frame),
            None => {
                let request = active.remove(&addr);
                drop(active);
                if let Some(request) = request {
                    request.done.resolve(Err(CommandError::Timeout));
                }
                TimeoutOutcome::Exhausted
            }
        }
    }

    /// Tear down the active request for a device with the given failure.
    pub fn abort(&self, addr: Address, error: CommandError) {
        let removed = crate::lock(&self.active).remove(&addr);
        if let Some(request) = removed {
            request.done.resolve(Err(error));
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
