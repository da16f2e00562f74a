use crate::server::channel::{Channel, ChannelIo, OP_READ, OP_WRITE};
use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use mio::Token;
use tracing::trace;

/// What the connection needs after a processing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketState {
    /// A request is partially parsed; its processor stays bound to the channel.
    NeedMoreData,
    /// Between requests; the processor can go back to the pool.
    KeepAlive,
    /// The response is not fully on the wire yet.
    WritePending,
    Closed,
}

/// Protocol state machine driven by the handler.
pub(crate) trait Processor: Send + Sync {
    fn process(&mut self, io: &dyn ChannelIo) -> SocketState;

    /// Forgets everything about the previous connection.
    fn recycle(&mut self);
}

pub(crate) type ProcessorFactory = Box<dyn Fn() -> Box<dyn Processor> + Send + Sync>;

/// Routes ready channels to processors.
///
/// A processor stays bound to its channel while a request is in flight and
/// returns to a bounded pool once the connection is idle or gone.
pub(crate) struct Handler {
    connections: DashMap<Token, Box<dyn Processor>>,
    recycled: ArrayQueue<Box<dyn Processor>>,
    factory: ProcessorFactory,
}

impl Handler {
    pub(crate) fn new(pool_size: usize, factory: ProcessorFactory) -> Self {
        Self {
            connections: DashMap::new(),
            recycled: ArrayQueue::new(pool_size.max(1)),
            factory,
        }
    }

    /// Runs one processing pass for `channel` and re-declares interest.
    pub(crate) fn handle(&self, channel: &Channel) -> SocketState {
        let token = channel.token();
        let mut processor = match self.connections.remove(&token) {
            Some((_, processor)) => processor,
            None => self.recycled.pop().unwrap_or_else(|| (self.factory)()),
        };

        let mut state = processor.process(channel);
        if channel.is_closed() {
            state = SocketState::Closed;
        }
        trace!(token = token.0, ?state, "processing pass finished");

        match state {
            SocketState::NeedMoreData | SocketState::WritePending => {
                self.connections.insert(token, processor);
                let ops = match state {
                    SocketState::WritePending => OP_WRITE,
                    _ => OP_READ,
                };
                channel.poller().declare(token, ops);
                // the poller may have cancelled the channel meanwhile
                if channel.is_closed() {
                    self.release(token);
                }
            }
            SocketState::KeepAlive => {
                self.recycle(processor);
                channel.poller().declare(token, OP_READ);
            }
            SocketState::Closed => self.recycle(processor),
        }
        state
    }

    /// Drops the binding for a cancelled channel.
    pub(crate) fn release(&self, token: Token) {
        if let Some((_, processor)) = self.connections.remove(&token) {
            self.recycle(processor);
        }
    }

    fn recycle(&self, mut processor: Box<dyn Processor>) {
        processor.recycle();
        // a full pool just drops the processor
        let _ = self.recycled.push(processor);
    }

    #[cfg(test)]
    pub(crate) fn bound(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub(crate) fn pooled(&self) -> usize {
        self.recycled.len()
    }
}

#[cfg(test)]
mod handler_tests {
    use super::*;
    use crate::server::poller::PollerShared;
    use mio::{net::TcpStream, Poll};
    use std::{
        net::{TcpListener, TcpStream as StdStream},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    struct Scripted {
        states: Arc<Mutex<Vec<SocketState>>>,
        recycled: Arc<AtomicUsize>,
    }

    impl Processor for Scripted {
        fn process(&mut self, _: &dyn ChannelIo) -> SocketState {
            self.states.lock().unwrap().remove(0)
        }

        fn recycle(&mut self) {
            self.recycled.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn channel() -> (Poll, Channel, StdStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let poll = Poll::new().unwrap();
        let shared = Arc::new(PollerShared::new(&poll).unwrap());
        let channel = Channel::new(
            TcpStream::from_std(server),
            peer,
            Token(3),
            shared,
            Duration::from_secs(1),
        );
        (poll, channel, client)
    }

    #[test]
    fn processor_sticks_while_request_in_flight() {
        use SocketState::*;

        let states = Arc::new(Mutex::new(vec![NeedMoreData, WritePending, KeepAlive, Closed]));
        let recycled = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));

        let handler = {
            let (states, recycled, created) = (states.clone(), recycled.clone(), created.clone());
            Handler::new(
                4,
                Box::new(move || -> Box<dyn Processor> {
                    created.fetch_add(1, Ordering::SeqCst);
                    Box::new(Scripted {
                        states: states.clone(),
                        recycled: recycled.clone(),
                    })
                }),
            )
        };
        let (_poll, channel, _client) = channel();

        assert_eq!(handler.handle(&channel), NeedMoreData);
        assert_eq!(handler.bound(), 1);
        assert_eq!(handler.handle(&channel), WritePending);
        assert_eq!(handler.bound(), 1);

        assert_eq!(handler.handle(&channel), KeepAlive);
        assert_eq!((handler.bound(), handler.pooled()), (0, 1));

        // the pooled processor is reused
        assert_eq!(handler.handle(&channel), Closed);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(recycled.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn closed_channel_overrides_state() {
        let states = Arc::new(Mutex::new(vec![SocketState::NeedMoreData]));
        let recycled = Arc::new(AtomicUsize::new(0));
        let handler = {
            let (states, recycled) = (states.clone(), recycled.clone());
            Handler::new(
                1,
                Box::new(move || -> Box<dyn Processor> {
                    Box::new(Scripted {
                        states: states.clone(),
                        recycled: recycled.clone(),
                    })
                }),
            )
        };
        let (_poll, channel, _client) = channel();
        channel.close();

        assert_eq!(handler.handle(&channel), SocketState::Closed);
        assert_eq!(handler.bound(), 0);
        assert_eq!(recycled.load(Ordering::SeqCst), 1);
    }
}
