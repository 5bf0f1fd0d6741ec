//! Multiplexed peer connection
//!
//! An [`MConnection`] carries several logical channels over one framed
//! stream. Each channel has its own bounded send queue; the writer always
//! drains the highest priority non-empty queue first. Keepalive pings are
//! sent on a fixed interval and a peer that stays silent for longer than
//! [`MConnConfig::read_timeout`] is considered dead.

use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::codec::Framed;

use crate::network::codec::FrameCodec;
use crate::network::config::MConnConfig;
use crate::network::message::{max_payload_size, Frame};
use crate::network::reactor::ChannelDescriptor;

/// Any bidirectional byte stream a connection can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased transport
pub type BoxedStream = Box<dyn AsyncStream>;

/// Transport wrapped in the frame codec
pub type FramedStream = Framed<BoxedStream, FrameCodec>;

type FrameSink = SplitSink<FramedStream, Frame>;
type FrameSource = SplitStream<FramedStream>;

/// Connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection already started")]
    AlreadyStarted,
}

/// Receives inbound messages and the terminal error of a connection
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_receive(&self, channel_id: u8, msg: Vec<u8>);

    /// Called at most once per connection
    fn on_error(&self, reason: String);
}

struct SendQueue {
    desc: ChannelDescriptor,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Shared between the reader and writer tasks
struct ConnState {
    notify: Notify,
    pong_pending: AtomicBool,
    errored: AtomicBool,
}

impl ConnState {
    fn report(&self, handler: &Arc<dyn ConnectionHandler>, reason: String) {
        if !self.errored.swap(true, Ordering::SeqCst) {
            handler.on_error(reason);
        }
    }
}

/// Multiplexed connection over a framed stream
pub struct MConnection {
    config: MConnConfig,
    senders: HashMap<u8, mpsc::Sender<Vec<u8>>>,
    /// Largest payload per channel, in both directions
    recv_capacities: HashMap<u8, usize>,
    pending: Mutex<Option<(FramedStream, Vec<SendQueue>)>>,
    state: Arc<ConnState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl MConnection {
    pub fn new(stream: FramedStream, channels: &[ChannelDescriptor], config: MConnConfig) -> Self {
        let mut senders = HashMap::new();
        let mut recv_capacities = HashMap::new();
        let mut queues = Vec::with_capacity(channels.len());
        let payload_limit = max_payload_size(config.max_frame_size);

        for desc in channels {
            let (tx, rx) = mpsc::channel(desc.send_queue_capacity.max(1));
            senders.insert(desc.id, tx);
            recv_capacities.insert(desc.id, desc.recv_message_capacity.min(payload_limit));
            queues.push(SendQueue {
                desc: desc.clone(),
                rx,
            });
        }

        // Highest priority first
        queues.sort_by(|a, b| b.desc.priority.cmp(&a.desc.priority));

        Self {
            config,
            senders,
            recv_capacities,
            pending: Mutex::new(Some((stream, queues))),
            state: Arc::new(ConnState {
                notify: Notify::new(),
                pong_pending: AtomicBool::new(false),
                errored: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Spawn the reader and writer tasks
    pub fn start(&self, handler: Arc<dyn ConnectionHandler>) -> Result<(), ConnectionError> {
        let (stream, queues) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ConnectionError::AlreadyStarted)?;

        let (sink, source) = stream.split();

        let writer = tokio::spawn(write_routine(
            sink,
            queues,
            self.config.clone(),
            self.state.clone(),
            handler.clone(),
        ));
        let reader = tokio::spawn(read_routine(
            source,
            self.recv_capacities.clone(),
            self.config.clone(),
            self.state.clone(),
            handler,
        ));

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(writer);
        tasks.push(reader);
        Ok(())
    }

    /// Tear down the connection. No error is reported after this.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.errored.store(true, Ordering::SeqCst);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_running(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
            && !self.state.errored.load(Ordering::SeqCst)
            && !self.tasks.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    /// Queue `msg` on `channel_id`, waiting for queue space
    pub async fn send(&self, channel_id: u8, msg: Vec<u8>) -> bool {
        let Some(tx) = self.sender_for(channel_id, msg.len()) else {
            return false;
        };

        if tx.send(msg).await.is_err() {
            return false;
        }
        self.state.notify.notify_one();
        true
    }

    /// Queue `msg` on `channel_id` without waiting; false if the queue is full
    pub fn try_send(&self, channel_id: u8, msg: Vec<u8>) -> bool {
        let Some(tx) = self.sender_for(channel_id, msg.len()) else {
            return false;
        };

        if tx.try_send(msg).is_err() {
            return false;
        }
        self.state.notify.notify_one();
        true
    }

    // Oversized messages are refused here; the writer would fail on them
    // and take the whole connection down
    fn sender_for(&self, channel_id: u8, len: usize) -> Option<&mpsc::Sender<Vec<u8>>> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        let Some(tx) = self.senders.get(&channel_id) else {
            log::warn!("Cannot send on unknown channel {:#04x}", channel_id);
            return None;
        };

        let capacity = self.recv_capacities.get(&channel_id).copied().unwrap_or(0);
        if len > capacity {
            log::warn!(
                "Refusing {} byte message on channel {:#04x}, capacity is {}",
                len,
                channel_id,
                capacity
            );
            return None;
        }
        Some(tx)
    }
}

impl Drop for MConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn write_routine(
    mut sink: FrameSink,
    mut queues: Vec<SendQueue>,
    config: MConnConfig,
    state: Arc<ConnState>,
    handler: Arc<dyn ConnectionHandler>,
) {
    let mut ping = time::interval_at(Instant::now() + config.ping_interval, config.ping_interval);

    loop {
        if state.pong_pending.swap(false, Ordering::SeqCst) {
            if let Err(e) = sink.send(Frame::Pong).await {
                state.report(&handler, format!("write pong: {}", e));
                return;
            }
        }

        if let Some((channel_id, payload)) = next_packet(&mut queues) {
            if let Err(e) = sink.send(Frame::Packet { channel_id, payload }).await {
                state.report(&handler, format!("write packet: {}", e));
                return;
            }
            continue;
        }

        tokio::select! {
            _ = state.notify.notified() => {}
            _ = ping.tick() => {
                if let Err(e) = sink.send(Frame::Ping).await {
                    state.report(&handler, format!("write ping: {}", e));
                    return;
                }
            }
        }
    }
}

fn next_packet(queues: &mut [SendQueue]) -> Option<(u8, Vec<u8>)> {
    queues
        .iter_mut()
        .find_map(|queue| queue.rx.try_recv().ok().map(|msg| (queue.desc.id, msg)))
}

async fn read_routine(
    mut source: FrameSource,
    recv_capacities: HashMap<u8, usize>,
    config: MConnConfig,
    state: Arc<ConnState>,
    handler: Arc<dyn ConnectionHandler>,
) {
    let read_timeout = config.read_timeout();

    loop {
        let frame = match time::timeout(read_timeout, source.next()).await {
            Err(_) => {
                state.report(&handler, format!("no data for {:?}", read_timeout));
                return;
            }
            Ok(None) => {
                state.report(&handler, "connection closed".to_string());
                return;
            }
            Ok(Some(Err(e))) => {
                state.report(&handler, format!("read: {}", e));
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Frame::Packet { channel_id, payload } => match recv_capacities.get(&channel_id) {
                None => {
                    state.report(&handler, format!("unknown channel {:#04x}", channel_id));
                    return;
                }
                Some(capacity) if payload.len() > *capacity => {
                    state.report(
                        &handler,
                        format!(
                            "message of {} bytes on channel {:#04x} exceeds capacity {}",
                            payload.len(),
                            channel_id,
                            capacity
                        ),
                    );
                    return;
                }
                Some(_) => handler.on_receive(channel_id, payload),
            },
            Frame::Ping => {
                state.pong_pending.store(true, Ordering::SeqCst);
                state.notify.notify_one();
            }
            Frame::Pong => {}
            other => {
                state.report(&handler, format!("unexpected {} frame", other.type_name()));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum Event {
        Received(u8, Vec<u8>),
        Error(String),
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    impl ConnectionHandler for Recorder {
        fn on_receive(&self, channel_id: u8, msg: Vec<u8>) {
            let _ = self.0.send(Event::Received(channel_id, msg));
        }

        fn on_error(&self, reason: String) {
            let _ = self.0.send(Event::Error(reason));
        }
    }

    fn recorder() -> (Arc<dyn ConnectionHandler>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder(tx)), rx)
    }

    fn framed_pair() -> (FramedStream, FramedStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Framed::new(Box::new(a) as BoxedStream, FrameCodec::default()),
            Framed::new(Box::new(b) as BoxedStream, FrameCodec::default()),
        )
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("handler dropped")
    }

    #[tokio::test]
    async fn test_messages_delivered() {
        let (a, b) = framed_pair();
        let channels = vec![ChannelDescriptor::new(0x01), ChannelDescriptor::new(0x02)];

        let left = MConnection::new(a, &channels, MConnConfig::default());
        let right = MConnection::new(b, &channels, MConnConfig::default());
        let (left_handler, _left_rx) = recorder();
        let (right_handler, mut right_rx) = recorder();
        left.start(left_handler).unwrap();
        right.start(right_handler).unwrap();

        assert!(left.send(0x02, b"hello".to_vec()).await);
        assert_eq!(
            next_event(&mut right_rx).await,
            Event::Received(0x02, b"hello".to_vec())
        );

        assert!(!left.send(0x09, b"nope".to_vec()).await);
    }

    #[tokio::test]
    async fn test_higher_priority_flushed_first() {
        let (a, mut raw) = framed_pair();
        let channels = vec![
            ChannelDescriptor::new(0x01).with_priority(1),
            ChannelDescriptor::new(0x02).with_priority(10),
        ];
        let conn = MConnection::new(a, &channels, MConnConfig::default());

        assert!(conn.try_send(0x01, b"low".to_vec()));
        assert!(conn.try_send(0x02, b"high".to_vec()));

        let (handler, _rx) = recorder();
        conn.start(handler).unwrap();

        let first = raw.next().await.unwrap().unwrap();
        assert_eq!(
            first,
            Frame::Packet {
                channel_id: 0x02,
                payload: b"high".to_vec()
            }
        );
        let second = raw.next().await.unwrap().unwrap();
        assert_eq!(
            second,
            Frame::Packet {
                channel_id: 0x01,
                payload: b"low".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn test_oversized_send_refused() {
        let (a, b) = framed_pair();
        let config = MConnConfig {
            max_frame_size: 4096,
            ..Default::default()
        };
        let capacity = max_payload_size(4096);
        let channels = vec![ChannelDescriptor::new(0x01)];

        let left = MConnection::new(a, &channels, config.clone());
        let right = MConnection::new(b, &channels, config);
        let (left_handler, mut left_rx) = recorder();
        let (right_handler, mut right_rx) = recorder();
        left.start(left_handler).unwrap();
        right.start(right_handler).unwrap();

        assert!(!left.try_send(0x01, vec![7; capacity + 1]));
        assert!(!left.send(0x01, vec![7; capacity + 1]).await);

        // A payload of exactly the capacity still fits in one frame
        assert!(left.send(0x01, vec![7; capacity]).await);
        assert_eq!(
            next_event(&mut right_rx).await,
            Event::Received(0x01, vec![7; capacity])
        );
        assert!(left.is_running());
        assert!(left_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_try_send_full_queue() {
        let (a, _raw) = framed_pair();
        let channels = vec![ChannelDescriptor::new(0x01).with_send_queue_capacity(1)];
        let conn = MConnection::new(a, &channels, MConnConfig::default());

        assert!(conn.try_send(0x01, vec![1]));
        assert!(!conn.try_send(0x01, vec![2]));
    }

    #[tokio::test]
    async fn test_ping_answered() {
        let (a, mut raw) = framed_pair();
        let conn = MConnection::new(a, &[ChannelDescriptor::new(0x01)], MConnConfig::default());
        let (handler, _rx) = recorder();
        conn.start(handler).unwrap();

        raw.send(Frame::Ping).await.unwrap();
        assert_eq!(raw.next().await.unwrap().unwrap(), Frame::Pong);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_error() {
        let (a, mut raw) = framed_pair();
        let conn = MConnection::new(a, &[ChannelDescriptor::new(0x01)], MConnConfig::default());
        let (handler, mut rx) = recorder();
        conn.start(handler).unwrap();

        raw.send(Frame::Packet {
            channel_id: 0x07,
            payload: vec![1],
        })
        .await
        .unwrap();

        match next_event(&mut rx).await {
            Event::Error(reason) => assert!(reason.contains("unknown channel")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_message_is_error() {
        let (a, mut raw) = framed_pair();
        let channels = vec![ChannelDescriptor::new(0x01).with_recv_message_capacity(4)];
        let conn = MConnection::new(a, &channels, MConnConfig::default());
        let (handler, mut rx) = recorder();
        conn.start(handler).unwrap();

        raw.send(Frame::Packet {
            channel_id: 0x01,
            payload: vec![0; 10],
        })
        .await
        .unwrap();

        match next_event(&mut rx).await {
            Event::Error(reason) => assert!(reason.contains("exceeds capacity")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handshake_frame_after_start_is_error() {
        let (a, mut raw) = framed_pair();
        let conn = MConnection::new(a, &[ChannelDescriptor::new(0x01)], MConnConfig::default());
        let (handler, mut rx) = recorder();
        conn.start(handler).unwrap();

        raw.send(Frame::Proof(crate::network::message::Proof {
            signature: String::new(),
        }))
        .await
        .unwrap();

        match next_event(&mut rx).await {
            Event::Error(reason) => assert!(reason.contains("unexpected Proof")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (a, _raw) = framed_pair();
        let config = MConnConfig {
            ping_interval: Duration::from_millis(50),
            pong_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let conn = MConnection::new(a, &[ChannelDescriptor::new(0x01)], config);
        let (handler, mut rx) = recorder();
        conn.start(handler).unwrap();

        match next_event(&mut rx).await {
            Event::Error(reason) => assert!(reason.contains("no data")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_reported_once() {
        let (a, raw) = framed_pair();
        let conn = MConnection::new(a, &[ChannelDescriptor::new(0x01)], MConnConfig::default());
        let (handler, mut rx) = recorder();
        conn.start(handler).unwrap();

        drop(raw);
        assert!(matches!(next_event(&mut rx).await, Event::Error(_)));

        // Writer notices the broken pipe on its next write
        let _ = conn.send(0x01, vec![1]).await;
        time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert!(!conn.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_and_stop() {
        let (a, _raw) = framed_pair();
        let conn = MConnection::new(a, &[ChannelDescriptor::new(0x01)], MConnConfig::default());
        let (handler, mut rx) = recorder();
        conn.start(handler.clone()).unwrap();
        assert!(conn.is_running());
        assert_eq!(conn.start(handler), Err(ConnectionError::AlreadyStarted));

        conn.stop();
        assert!(!conn.is_running());
        assert!(!conn.send(0x01, vec![1]).await);
        assert!(!conn.try_send(0x01, vec![1]));

        time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }
}
