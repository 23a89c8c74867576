/**
 * Test doubles for the host capabilities: a recording transport and a manual
 * clock.
 */
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use slog::{o, Logger};

use crate::{
    config::Settings,
    error::Error,
    stun::StunMessage,
    transport::{TimerHandle, TimerService, Transport},
    Context, Result,
};

pub(crate) fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/**
 * Context with default settings and a silent logger. Reads the environment,
 * so tests using it run under `#[serial]`.
 */
pub(crate) fn test_context() -> Context {
    Context {
        config: Settings::new().expect("default settings"),
        logger: test_logger(),
    }
}

#[derive(Default)]
pub(crate) struct MockTransport {
    sent: RefCell<Vec<(Vec<u8>, SocketAddr)>>,
    failing: Cell<bool>,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.sent.borrow().len()
    }

    pub(crate) fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.borrow().clone()
    }

    pub(crate) fn take_sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.borrow_mut().drain(..).collect()
    }

    /// Parse the most recent packet as a STUN message.
    pub(crate) fn last_message(&self) -> Option<(StunMessage, SocketAddr)> {
        let sent = self.sent.borrow();
        let (bytes, dest) = sent.last()?;
        StunMessage::parse(bytes).ok().map(|msg| (msg, *dest))
    }
}

impl Transport for MockTransport {
    fn send(&self, bytes: &[u8], dest: SocketAddr) -> Result<()> {
        if self.failing.get() {
            return Err(Error::Transport("mock transport is down".into()));
        }
        self.sent.borrow_mut().push((bytes.to_vec(), dest));
        Ok(())
    }
}

/**
 * Timer service driven by the test: nothing fires until `fire_next` moves the
 * clock to the earliest deadline.
 */
pub(crate) struct MockTimers {
    now: Cell<Instant>,
    next_id: Cell<u64>,
    pending: RefCell<BTreeMap<TimerHandle, Instant>>,
}

impl MockTimers {
    pub(crate) fn new() -> Self {
        Self {
            now: Cell::new(Instant::now()),
            next_id: Cell::new(1),
            pending: RefCell::new(BTreeMap::new()),
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.borrow().len()
    }

    /**
     * Advance the clock to the earliest pending deadline and return that timer.
     * Timers with equal deadlines fire in scheduling order.
     */
    pub(crate) fn fire_next(&self) -> Option<TimerHandle> {
        let mut pending = self.pending.borrow_mut();
        let (handle, deadline) = pending
            .iter()
            .min_by_key(|(handle, deadline)| (**deadline, **handle))
            .map(|(h, d)| (*h, *d))?;
        pending.remove(&handle);
        if deadline > self.now.get() {
            self.now.set(deadline);
        }
        Some(handle)
    }
}

impl TimerService for MockTimers {
    fn schedule(&self, delay: Duration) -> TimerHandle {
        let handle = TimerHandle(self.next_id.get());
        self.next_id.set(handle.0 + 1);
        self.pending
            .borrow_mut()
            .insert(handle, self.now.get() + delay);
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        self.pending.borrow_mut().remove(&handle);
    }

    fn now(&self) -> Instant {
        self.now.get()
    }
}
