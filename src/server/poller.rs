//! Readiness loop.
//!
//! The poller thread owns the [`mio::Poll`] and every registration. Other
//! threads never touch the selector: they push an [`Intent`] onto a lock-free
//! queue and wake the poller, which applies intents in order at the top of
//! each iteration.

use crate::server::{
    admission::Admission,
    channel::{now_millis, Channel, Completion, OP_READ, OP_WRITE},
    handler::{Handler, SocketState},
    pool::WorkerPool,
};
use crossbeam::queue::SegQueue;
use mio::{event::Event, Events, Interest, Poll, Token, Waker};
use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, trace, warn};

const WAKER_TOKEN: Token = Token(0);

pub(crate) enum Intent {
    Register(Arc<Channel>),
    /// Adds operations to the channel's interest.
    Interest(Token, u8),
    Close(Token),
}

/// The part of the poller other threads can reach.
pub(crate) struct PollerShared {
    queue: SegQueue<Intent>,
    waker: Waker,
    next_token: AtomicUsize,
    closing: AtomicBool,
}

impl PollerShared {
    pub(crate) fn new(poll: &Poll) -> io::Result<Self> {
        Ok(Self {
            queue: SegQueue::new(),
            waker: Waker::new(poll.registry(), WAKER_TOKEN)?,
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
            closing: AtomicBool::new(false),
        })
    }

    pub(crate) fn allocate_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn register(&self, channel: Arc<Channel>) {
        self.push(Intent::Register(channel));
    }

    #[inline]
    pub(crate) fn declare(&self, token: Token, ops: u8) {
        self.push(Intent::Interest(token, ops));
    }

    #[inline]
    pub(crate) fn cancel(&self, token: Token) {
        self.push(Intent::Close(token));
    }

    /// Asks the loop to exit after its current iteration.
    pub(crate) fn close(&self) {
        self.closing.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake poller");
        }
    }

    #[inline]
    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn push(&self, intent: Intent) {
        self.queue.push(intent);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "failed to wake poller");
        }
    }
}

struct Entry {
    channel: Arc<Channel>,
    registered: bool,
}

pub(crate) struct PollerConfig {
    pub(crate) max_events: usize,
    pub(crate) poll_timeout: Duration,
    pub(crate) sweep_interval: Duration,
    pub(crate) socket_timeout: Duration,
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    shared: Arc<PollerShared>,
    channels: HashMap<Token, Entry>,

    handler: Arc<Handler>,
    pool: WorkerPool,
    admission: Arc<Admission>,

    poll_timeout: Duration,
    sweep_interval: Duration,
    socket_timeout: Duration,
    next_sweep: Instant,
}

impl Poller {
    pub(crate) fn new(
        poll: Poll,
        shared: Arc<PollerShared>,
        handler: Arc<Handler>,
        pool: WorkerPool,
        admission: Arc<Admission>,
        config: PollerConfig,
    ) -> Self {
        Self {
            poll,
            events: Events::with_capacity(config.max_events),
            shared,
            channels: HashMap::new(),
            handler,
            pool,
            admission,
            poll_timeout: config.poll_timeout,
            sweep_interval: config.sweep_interval,
            socket_timeout: config.socket_timeout,
            next_sweep: Instant::now() + config.sweep_interval,
        }
    }

    pub(crate) fn run(mut self) {
        debug!("poller started");
        let mut ready = Vec::new();

        loop {
            self.drain_intents();
            if self.shared.is_closing() {
                break;
            }

            if let Err(e) = self.poll.poll(&mut self.events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %e, "poll failed");
                break;
            }

            ready.clear();
            ready.extend(
                self.events
                    .iter()
                    .filter(|event| event.token() != WAKER_TOKEN)
                    .map(|event| (event.token(), readiness(event))),
            );
            let idle = self.events.is_empty();

            for &(token, ops) in &ready {
                self.on_ready(token, ops);
            }
            self.maybe_sweep(idle);
        }

        self.shutdown();
    }

    fn drain_intents(&mut self) {
        while let Some(intent) = self.shared.queue.pop() {
            match intent {
                Intent::Register(channel) => self.add(channel),
                Intent::Interest(token, ops) => self.merge_interest(token, ops),
                Intent::Close(token) => self.cancel(token),
            }
        }
    }

    fn add(&mut self, channel: Arc<Channel>) {
        let token = channel.token();
        channel.set_interest(OP_READ);
        channel.access();

        let result = self
            .poll
            .registry()
            .register(&mut *channel.socket().lock(), token, Interest::READABLE);

        match result {
            Ok(()) => {
                trace!(token = token.0, peer = %channel.peer(), "channel registered");
                self.channels.insert(
                    token,
                    Entry {
                        channel,
                        registered: true,
                    },
                );
            }
            Err(e) => {
                warn!(token = token.0, error = %e, "failed to register channel");
                channel.close();
                self.admission.release();
            }
        }
    }

    fn merge_interest(&mut self, token: Token, ops: u8) {
        let Some(entry) = self.channels.get_mut(&token) else {
            return;
        };
        let channel = &entry.channel;
        channel.set_interest(channel.interest() | ops);
        // the channel was active; its idle clock starts over
        channel.access();
        apply(&self.poll, entry);
    }

    fn on_ready(&mut self, token: Token, ready: u8) {
        let Some(entry) = self.channels.get_mut(&token) else {
            return;
        };
        let channel = entry.channel.clone();
        let ready = ready & channel.interest();
        if ready == 0 {
            return;
        }

        channel.access();
        channel.set_interest(channel.interest() & !ready);
        apply(&self.poll, entry);

        match channel.complete_pending(ready) {
            Completion::Fired => {}
            Completion::Waiting(op) => self.merge_interest(token, op),
            Completion::Idle => self.dispatch(channel),
        }
    }

    fn dispatch(&mut self, channel: Arc<Channel>) {
        let token = channel.token();
        let handler = self.handler.clone();
        let job = move || {
            if handler.handle(&channel) == SocketState::Closed {
                channel.poller().cancel(channel.token());
            }
        };

        if self.pool.execute(job).is_err() {
            warn!(token = token.0, "worker queue full, dropping connection");
            self.cancel(token);
        }
    }

    /// Removes the channel and frees everything tied to it.
    fn cancel(&mut self, token: Token) {
        let Some(mut entry) = self.channels.remove(&token) else {
            return;
        };
        if entry.registered {
            let _ = self
                .poll
                .registry()
                .deregister(&mut *entry.channel.socket().lock());
            entry.registered = false;
        }

        entry.channel.set_interest(0);
        entry.channel.close();
        self.admission.release();
        self.handler.release(token);
        debug!(token = token.0, peer = %entry.channel.peer(), "channel closed");
    }

    fn maybe_sweep(&mut self, idle: bool) {
        let now = Instant::now();
        if !idle && now < self.next_sweep {
            return;
        }
        self.next_sweep = now + self.sweep_interval;

        let now_ms = now_millis();
        let expired: Vec<Token> = self
            .channels
            .iter()
            .filter(|(_, entry)| {
                let channel = &entry.channel;
                channel.interest() & (OP_READ | OP_WRITE) != 0
                    && channel.idle_for(now_ms) > self.socket_timeout
            })
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            debug!(token = token.0, "evicting idle channel");
            self.cancel(token);
        }
    }

    fn shutdown(&mut self) {
        self.drain_intents();
        let tokens: Vec<Token> = self.channels.keys().copied().collect();
        let open = tokens.len();
        for token in tokens {
            self.cancel(token);
        }
        info!(closed = open, "poller stopped");
        // `pool` is dropped with `self`, joining the workers
    }
}

/// Brings the selector registration in line with the channel's interest.
fn apply(poll: &Poll, entry: &mut Entry) {
    let interest = to_interest(entry.channel.interest());
    let mut socket = entry.channel.socket().lock();
    let registry = poll.registry();

    let result = match (interest, entry.registered) {
        (Some(interest), true) => registry.reregister(&mut *socket, entry.channel.token(), interest),
        (Some(interest), false) => registry.register(&mut *socket, entry.channel.token(), interest),
        (None, true) => registry.deregister(&mut *socket),
        (None, false) => return,
    };

    match result {
        Ok(()) => entry.registered = interest.is_some(),
        Err(e) => {
            warn!(token = entry.channel.token().0, error = %e, "failed to update registration")
        }
    }
}

fn to_interest(ops: u8) -> Option<Interest> {
    match (ops & OP_READ != 0, ops & OP_WRITE != 0) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

fn readiness(event: &Event) -> u8 {
    let mut ops = 0;
    if event.is_readable() || event.is_read_closed() || event.is_error() {
        ops |= OP_READ;
    }
    if event.is_writable() || event.is_write_closed() || event.is_error() {
        ops |= OP_WRITE;
    }
    ops
}

#[cfg(test)]
mod poller_tests {
    use super::*;

    #[test]
    fn interest_mapping() {
        assert_eq!(to_interest(0), None);
        assert_eq!(to_interest(OP_READ), Some(Interest::READABLE));
        assert_eq!(to_interest(OP_WRITE), Some(Interest::WRITABLE));
        assert_eq!(
            to_interest(OP_READ | OP_WRITE),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
    }

    #[test]
    fn tokens_skip_the_waker() {
        let poll = Poll::new().unwrap();
        let shared = PollerShared::new(&poll).unwrap();

        let first = shared.allocate_token();
        assert_ne!(first, WAKER_TOKEN);
        assert_eq!(shared.allocate_token(), Token(first.0 + 1));
    }

    #[test]
    fn intents_are_queued_in_order() {
        let poll = Poll::new().unwrap();
        let shared = PollerShared::new(&poll).unwrap();

        shared.declare(Token(5), OP_READ);
        shared.cancel(Token(5));
        assert!(matches!(shared.queue.pop(), Some(Intent::Interest(Token(5), OP_READ))));
        assert!(matches!(shared.queue.pop(), Some(Intent::Close(Token(5)))));
        assert!(shared.queue.pop().is_none());

        assert!(!shared.is_closing());
        shared.close();
        assert!(shared.is_closing());
    }
}
