//! Instrumented in-memory transport for tests.

use std::collections::VecDeque;
use std::io::{Error as IoError, ErrorKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::raw::Transport;

/// Scripted transport that records every call made on it.
pub(crate) struct MockTransport {
    reads: Mutex<VecDeque<Result<Message, WsError>>>,
    writes: Mutex<Vec<Message>>,
    write_delay: Duration,
    fail_write_at: Option<usize>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    write_calls: AtomicUsize,
    close_calls: AtomicUsize,
    closed: watch::Sender<bool>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            reads: Mutex::new(VecDeque::new()),
            writes: Mutex::new(Vec::new()),
            write_delay: Duration::ZERO,
            fail_write_at: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            closed,
        }
    }

    /// Queues read results. Once exhausted, reads park until close.
    pub(crate) fn with_reads(self, reads: impl IntoIterator<Item = Result<Message, WsError>>) -> Self {
        self.reads.lock().extend(reads);
        self
    }

    /// Every write takes at least `delay` to complete.
    pub(crate) fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// The write with this zero-based index fails.
    pub(crate) fn with_failing_write(mut self, index: usize) -> Self {
        self.fail_write_at = Some(index);
        self
    }

    pub(crate) fn written(&self) -> Vec<Message> {
        self.writes.lock().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

pub(crate) fn io_error(message: &str) -> WsError {
    WsError::Io(IoError::new(ErrorKind::ConnectionReset, message.to_string()))
}

#[async_trait]
impl Transport for MockTransport {
    async fn read_message(&self) -> Result<Message, WsError> {
        let next = self.reads.lock().pop_front();
        match next {
            Some(result) => result,
            None => {
                self.wait_closed().await;
                Err(WsError::AlreadyClosed)
            }
        }
    }

    async fn write_message(&self, message: Message) -> Result<(), WsError> {
        let index = self.write_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }

        let result = if self.fail_write_at == Some(index) {
            Err(io_error("mock write failure"))
        } else if *self.closed.borrow() {
            Err(WsError::AlreadyClosed)
        } else {
            self.writes.lock().push(message);
            Ok(())
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.send_replace(true);
    }
}
