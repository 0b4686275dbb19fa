use crate::grammar::GrammarError;
use crate::parser::ParseError;
use crate::scheduler::ScheduleError;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: String,
    pub recipient: Option<String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(sender: &str, recipient: Option<&str>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sender: sender.to_string(),
            recipient: recipient.map(str::to_string),
            payload: payload.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ExchangeError {
    /// The endpoint did not answer in time.
    #[error("No message within {0:?}")]
    Timeout(Duration),
    /// A received message matches none of the packets that may come next.
    #[error("Unexpected message from {sender}: {payload:?}")]
    UnexpectedMessage { sender: String, payload: String },
    /// The endpoint went away.
    #[error("Endpoint disconnected")]
    Disconnected,
    /// The endpoint reported a failure or panicked.
    #[error("Endpoint failed: {0}")]
    Endpoint(String),
    /// No packet can continue an exchange that is not complete yet.
    #[error("Exchange stuck after {0} messages")]
    Stuck(usize),
    /// The message cap was hit before the exchange could complete.
    #[error("Exchange cut off after {0} messages")]
    Truncated(usize),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Grammar(#[from] GrammarError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// The channel to the system under test. Supplied by the caller.
pub trait Transport {
    fn send(&mut self, message: &Message) -> Result<(), ExchangeError>;

    /// Blocks for the next message, failing with `ExchangeError::Timeout`
    /// once `timeout` elapses.
    fn receive(&mut self, timeout: Duration) -> Result<Message, ExchangeError>;

    /// Called before every exchange round.
    fn reset(&mut self) -> Result<(), ExchangeError> {
        Ok(())
    }
}

/// Handles one delivered message and returns the replies.
pub type Harness = Box<dyn FnMut(Message) -> anyhow::Result<Vec<Message>> + Send>;

/// How long `reset` waits for the worker by default.
const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_millis(2000);

enum Request {
    Deliver(Message),
    Reset(u64),
}

enum Reply {
    Message(Message),
    Failed(String),
    ResetDone(u64),
}

/// Runs a harness closure on a worker thread and talks to it over
/// channels, so a hanging harness turns into a timeout.
///
/// A worker stuck in the harness is never waited for: `reset` gives up
/// after its timeout and dropping the endpoint detaches the thread.
pub struct InProcessEndpoint {
    requests: Option<Sender<Request>>,
    replies: Receiver<Reply>,
    worker: Option<JoinHandle<()>>,
    /// Requests sent but not yet handled by the worker.
    in_flight: Arc<AtomicUsize>,
    reset_timeout: Duration,
    resets: u64,
}

impl InProcessEndpoint {
    pub fn new<F>(harness: F) -> Self
    where
        F: FnMut(Message) -> anyhow::Result<Vec<Message>> + Send + 'static,
    {
        let mut harness: Harness = Box::new(harness);
        let (request_tx, request_rx) = mpsc::channel::<Request>();
        let (reply_tx, reply_rx) = mpsc::channel::<Reply>();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let pending = Arc::clone(&in_flight);
        let worker = thread::spawn(move || {
            for request in request_rx {
                let replies = match request {
                    Request::Reset(id) => vec![Reply::ResetDone(id)],
                    Request::Deliver(message) => {
                        match catch_unwind(AssertUnwindSafe(|| harness(message))) {
                            Ok(Ok(messages)) => messages.into_iter().map(Reply::Message).collect(),
                            Ok(Err(e)) => vec![Reply::Failed(e.to_string())],
                            Err(panic_payload) => vec![Reply::Failed(panic_message(&*panic_payload))],
                        }
                    }
                };
                pending.fetch_sub(1, Ordering::SeqCst);
                for reply in replies {
                    if reply_tx.send(reply).is_err() {
                        return;
                    }
                }
            }
        });
        Self {
            requests: Some(request_tx),
            replies: reply_rx,
            worker: Some(worker),
            in_flight,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            resets: 0,
        }
    }

    /// Sets how long `reset` waits for a busy harness before failing with
    /// `ExchangeError::Timeout`.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    fn request(&self, request: Request) -> Result<(), ExchangeError> {
        let requests = self.requests.as_ref().ok_or(ExchangeError::Disconnected)?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        requests.send(request).map_err(|_| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            ExchangeError::Disconnected
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

impl Transport for InProcessEndpoint {
    fn send(&mut self, message: &Message) -> Result<(), ExchangeError> {
        self.request(Request::Deliver(message.clone()))
    }

    fn receive(&mut self, timeout: Duration) -> Result<Message, ExchangeError> {
        loop {
            match self.replies.recv_timeout(timeout) {
                Ok(Reply::Message(message)) => return Ok(message),
                Ok(Reply::Failed(reason)) => {
                    warn!(%reason, "In-process endpoint failed");
                    return Err(ExchangeError::Endpoint(reason));
                }
                Ok(Reply::ResetDone(_)) => continue,
                Err(RecvTimeoutError::Timeout) => return Err(ExchangeError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => return Err(ExchangeError::Disconnected),
            }
        }
    }

    /// Drops replies still queued from the previous round. Acknowledgements
    /// of earlier, timed-out resets are dropped like any stale reply.
    fn reset(&mut self) -> Result<(), ExchangeError> {
        self.resets += 1;
        let id = self.resets;
        self.request(Request::Reset(id))?;
        let deadline = Instant::now() + self.reset_timeout;
        let mut dropped = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(Reply::ResetDone(done)) if done == id => break,
                Ok(_) => dropped += 1,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(timeout = ?self.reset_timeout, "In-process endpoint still busy, reset abandoned");
                    return Err(ExchangeError::Timeout(self.reset_timeout));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(ExchangeError::Disconnected),
            }
        }
        if dropped > 0 {
            debug!(dropped, "Discarded stale endpoint replies");
        }
        Ok(())
    }
}

impl Drop for InProcessEndpoint {
    fn drop(&mut self) {
        self.requests.take();
        let Some(worker) = self.worker.take() else {
            return;
        };
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        if in_flight > 0 {
            debug!(in_flight, "Detaching busy in-process endpoint worker");
            return;
        }
        if worker.join().is_err() {
            warn!("In-process endpoint worker panicked");
        }
    }
}
