// Jackson Coxson
//! DTX connection: fragment reassembly, channel bookkeeping, request/reply
//! correlation and asynchronous notification dispatch over a single socket.
//!
//! One reader task owns the socket's read half and is the sole place
//! fragments are reassembled. A single send mutex around the write half
//! guarantees two concurrent callers never interleave a message's fragments
//! on the wire. Callback invocation happens on a small worker pool so a slow
//! handler never stalls the reader.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::{IdeviceError, ReadWrite};

use super::message::{AuxBuffer, DtxMessage, MessageKey, PayloadKind};

/// Selector under which async, non-reply notifications are also dispatched
/// in addition to any selector-specific callback.
pub const NOTIFICATION: &str = "NOTIFICATION";
/// Fired exactly once when the connection's reader observes end-of-stream.
pub const FINISHED: &str = "FINISHED";

const WORKER_COUNT: usize = 4;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type Callback = Arc<dyn Fn(DtxMessage) + Send + Sync>;

struct WorkItem {
    selector: String,
    message: DtxMessage,
}

struct Shared {
    write_half: Mutex<WriteHalf<Box<dyn ReadWrite>>>,
    next_message_id: AtomicU32,
    next_channel_code: AtomicI32,
    waiters: StdMutex<HashMap<MessageKey, oneshot::Sender<Result<DtxMessage, IdeviceError>>>>,
    callbacks: StdMutex<HashMap<String, Vec<Callback>>>,
    finished_once: Notify,
    is_finished: AtomicBool,
    worker_tx: mpsc::UnboundedSender<WorkItem>,
}

/// A live DTX connection.
///
/// Clones are cheap and share the same reader task, send mutex, waiter
/// table and callback registry; this mirrors how a single socket is used
/// from multiple channel handles concurrently.
#[derive(Clone)]
pub struct DtxConnection {
    shared: Arc<Shared>,
    reader: Arc<JoinHandle<()>>,
}

impl std::fmt::Debug for DtxConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtxConnection").finish_non_exhaustive()
    }
}

/// A handle to one logical channel of a [`DtxConnection`].
#[derive(Debug, Clone, Copy)]
pub struct Channel {
    pub id: i32,
}

impl DtxConnection {
    /// Wraps `socket` and starts the reader task and worker pool.
    ///
    /// Performs the channel-0 capabilities handshake before returning, per
    /// the DTX convention that the first message on a fresh connection is
    /// `_notifyOfPublishedCapabilities:`.
    pub async fn connect(socket: Box<dyn ReadWrite>) -> Result<Self, IdeviceError> {
        let (read_half, write_half) = tokio::io::split(socket);

        let (worker_tx, worker_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            write_half: Mutex::new(write_half),
            next_message_id: AtomicU32::new(1),
            next_channel_code: AtomicI32::new(1),
            waiters: StdMutex::new(HashMap::new()),
            callbacks: StdMutex::new(HashMap::new()),
            finished_once: Notify::new(),
            is_finished: AtomicBool::new(false),
            worker_tx,
        });

        spawn_workers(shared.clone(), worker_rx);
        let reader = tokio::spawn(reader_loop(shared.clone(), read_half));

        let conn = Self {
            shared,
            reader: Arc::new(reader),
        };

        conn.handshake().await?;
        Ok(conn)
    }

    async fn handshake(&self) -> Result<(), IdeviceError> {
        let aux = AuxBuffer::new().push(super::message::AuxValue::archived(
            crate::plist!(dict { "com.apple.private.DTXBlockCompression": 0i64 }),
        )?);
        let reply = self
            .call(0, "_notifyOfPublishedCapabilities:", aux, true)
            .await?;
        if reply.is_none() {
            return Err(IdeviceError::ProtocolError(
                "device did not reply to capabilities handshake".into(),
            ));
        }
        Ok(())
    }

    /// Registers a callback invoked for every notification matching `selector`
    /// (or the [`NOTIFICATION`]/[`FINISHED`] sentinels). Handlers run on the
    /// worker pool, never on the reader task.
    pub fn on(&self, selector: impl Into<String>, handler: impl Fn(DtxMessage) + Send + Sync + 'static) {
        self.shared
            .callbacks
            .lock()
            .unwrap()
            .entry(selector.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Blocks until the connection's `FINISHED` event fires.
    pub async fn wait_finished(&self) {
        if self.shared.is_finished.load(Ordering::SeqCst) {
            return;
        }
        self.shared.finished_once.notified().await;
    }

    /// Allocates the next unused positive channel code and asks the device
    /// to bind `identifier` to it via `_requestChannelWithCode:identifier:`
    /// on the implicit root channel.
    pub async fn make_channel(&self, identifier: &str) -> Result<Channel, IdeviceError> {
        let code = self.shared.next_channel_code.fetch_add(1, Ordering::SeqCst);
        let aux = AuxBuffer::new()
            .push(super::message::AuxValue::I32(code))
            .push(super::message::AuxValue::archived(identifier.to_string())?);

        let reply = self
            .call(0, "_requestChannelWithCode:identifier:", aux, true)
            .await?;
        if let Some(msg) = reply {
            if !msg.payload.is_empty() {
                return Err(IdeviceError::UnexpectedResponse);
            }
        }
        Ok(Channel { id: code })
    }

    /// Invokes `selector` with `aux` arguments on `channel`, optionally
    /// waiting for the matching reply. Uses the default 30s deadline.
    pub async fn call(
        &self,
        channel: i32,
        selector: &str,
        aux: AuxBuffer,
        expects_reply: bool,
    ) -> Result<Option<DtxMessage>, IdeviceError> {
        self.call_with_timeout(channel, selector, aux, expects_reply, DEFAULT_TIMEOUT)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        channel: i32,
        selector: &str,
        aux: AuxBuffer,
        expects_reply: bool,
        timeout: Duration,
    ) -> Result<Option<DtxMessage>, IdeviceError> {
        let message_id = self.shared.next_message_id.fetch_add(1, Ordering::SeqCst);
        let message = DtxMessage::invocation(channel, message_id, 0, selector, aux, expects_reply)?;

        let waiter = expects_reply.then(|| {
            let (tx, rx) = oneshot::channel();
            let key = MessageKey {
                channel_id: channel,
                message_id,
            };
            self.shared.waiters.lock().unwrap().insert(key, tx);
            (key, rx)
        });

        self.send(&message).await?;

        let Some((key, rx)) = waiter else {
            return Ok(None);
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(msg))) => Ok(Some(msg)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(IdeviceError::Cancelled),
            Err(_) => {
                self.shared.waiters.lock().unwrap().remove(&key);
                Err(IdeviceError::Timeout)
            }
        }
    }

    /// Sends a raw archived-object payload on `channel` without wrapping it
    /// as a selector invocation, used for `XCTestConfiguration` delivery.
    pub async fn send_raw_archive(
        &self,
        channel: i32,
        payload: Vec<u8>,
        expects_reply: bool,
    ) -> Result<(), IdeviceError> {
        let message_id = self.shared.next_message_id.fetch_add(1, Ordering::SeqCst);
        let message = DtxMessage::raw_archive(channel, message_id, 0, payload, expects_reply);
        self.send(&message).await
    }

    /// Replies to an in-flight invocation with a raw archived-object payload,
    /// reusing its `message_id` with `conversation_index = 1` as the DTX
    /// reply convention requires. Used to answer
    /// `_XCT_testRunnerReadyWithCapabilities:` with an `XCTestConfiguration`.
    pub async fn reply_with_raw_archive(
        &self,
        channel: i32,
        message_id: u32,
        payload: Vec<u8>,
    ) -> Result<(), IdeviceError> {
        let message = DtxMessage::raw_archive(channel, message_id, 1, payload, false);
        self.send(&message).await
    }

    async fn send(&self, message: &DtxMessage) -> Result<(), IdeviceError> {
        let bytes = message.serialize();
        let mut guard = self.shared.write_half.lock().await;
        guard.write_all(&bytes).await?;
        guard.flush().await?;
        Ok(())
    }

    /// Cancels all pending waiters with [`IdeviceError::Cancelled`] and closes
    /// the reader task, firing `FINISHED` if it hasn't already.
    pub fn close(&self) {
        self.reader.abort();
        fail_all_waiters(&self.shared, IdeviceError::Cancelled);
        fire_finished(&self.shared);
    }
}

impl Drop for DtxConnection {
    fn drop(&mut self) {
        // Only the last clone tears the connection down.
        if Arc::strong_count(&self.shared) == 1 {
            self.close();
        }
    }
}

fn spawn_workers(shared: Arc<Shared>, rx: mpsc::UnboundedReceiver<WorkItem>) {
    let rx = Arc::new(Mutex::new(rx));
    for _ in 0..WORKER_COUNT {
        let rx = rx.clone();
        let shared = shared.clone();
        tokio::spawn(async move {
            loop {
                let item = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let Some(item) = item else { break };
                let handlers: Vec<Callback> = shared
                    .callbacks
                    .lock()
                    .unwrap()
                    .get(&item.selector)
                    .cloned()
                    .unwrap_or_default();
                for handler in handlers {
                    handler(item.message.clone());
                }
            }
        });
    }
}

async fn reader_loop(shared: Arc<Shared>, mut read_half: ReadHalf<Box<dyn ReadWrite>>) {
    loop {
        let message = match DtxMessage::read(&mut read_half).await {
            Ok(m) => m,
            Err(e) => {
                debug!("DTX reader closing: {e:?}");
                break;
            }
        };
        trace!("DTX recv {:?}", message.key());
        dispatch(&shared, message);
    }
    fail_all_waiters(&shared, IdeviceError::Cancelled);
    fire_finished(&shared);
}

fn dispatch(shared: &Arc<Shared>, message: DtxMessage) {
    if message.conversation_index == 1 {
        let key = message.key();
        if let Some(waiter) = shared.waiters.lock().unwrap().remove(&key) {
            let _ = waiter.send(Ok(message));
            return;
        }
        warn!("dropping late DTX reply for {key:?}");
        return;
    }

    let selector = message.selector().unwrap_or_default();
    let selector_for_registry = if selector.is_empty() {
        NOTIFICATION.to_string()
    } else {
        selector.clone()
    };

    // Always also fan out to the generic NOTIFICATION sentinel so callers
    // can log/inspect everything unsolicited, in addition to any specific
    // selector subscription.
    for dest in [selector_for_registry, NOTIFICATION.to_string()] {
        if dest == NOTIFICATION
            && shared
                .callbacks
                .lock()
                .unwrap()
                .get(NOTIFICATION)
                .is_none()
        {
            continue;
        }
        let _ = shared.worker_tx.send(WorkItem {
            selector: dest,
            message: message.clone(),
        });
    }
}

fn fail_all_waiters(shared: &Arc<Shared>, err: IdeviceError) {
    let mut waiters = shared.waiters.lock().unwrap();
    for (_, tx) in waiters.drain() {
        let _ = tx.send(Err(clone_err(&err)));
    }
}

fn fire_finished(shared: &Arc<Shared>) {
    if shared
        .is_finished
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        shared.finished_once.notify_waiters();
        let handlers: Vec<Callback> = shared
            .callbacks
            .lock()
            .unwrap()
            .get(FINISHED)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(DtxMessage::ack(0, 0, 0));
        }
    }
}

fn clone_err(err: &IdeviceError) -> IdeviceError {
    match err {
        IdeviceError::Cancelled => IdeviceError::Cancelled,
        IdeviceError::Timeout => IdeviceError::Timeout,
        other => IdeviceError::ProtocolError(format!("{other:?}")),
    }
}

// Only used via `PayloadKind::Ack` construction in `fire_finished`'s sentinel
// notification; keeps `DtxMessage::ack` from looking unused.
#[allow(dead_code)]
fn _payload_kind_ack_is_used(_: PayloadKind) {}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, DuplexStream};

    use super::*;

    async fn connected_pair() -> (DtxConnection, DuplexStream) {
        let (client, mut peer) = tokio::io::duplex(64 * 1024);

        let handle = tokio::spawn(async move { DtxConnection::connect(Box::new(client)).await });

        let handshake = DtxMessage::read(&mut peer).await.unwrap();
        assert_eq!(
            handshake.selector().as_deref(),
            Some("_notifyOfPublishedCapabilities:")
        );
        assert!(handshake.expects_reply);

        let reply = DtxMessage::raw_archive(0, handshake.message_id, 1, Vec::new(), false);
        peer.write_all(&reply.serialize()).await.unwrap();
        peer.flush().await.unwrap();

        let conn = handle.await.unwrap().unwrap();
        (conn, peer)
    }

    #[tokio::test]
    async fn connect_performs_capabilities_handshake() {
        let (_conn, _peer) = connected_pair().await;
    }

    #[tokio::test]
    async fn call_times_out_without_a_reply() {
        let (conn, _peer) = connected_pair().await;
        let result = conn
            .call_with_timeout(
                1,
                "_someSelector:",
                AuxBuffer::new(),
                true,
                Duration::from_millis(50),
            )
            .await;
        assert!(matches!(result, Err(IdeviceError::Timeout)));
    }

    #[tokio::test]
    async fn reply_is_correlated_to_the_right_waiter() {
        let (conn, mut peer) = connected_pair().await;

        let call = tokio::spawn({
            let conn = conn.clone();
            async move {
                conn.call_with_timeout(
                    2,
                    "_doSomething:",
                    AuxBuffer::new(),
                    true,
                    Duration::from_secs(5),
                )
                .await
            }
        });

        let invocation = DtxMessage::read(&mut peer).await.unwrap();
        assert_eq!(invocation.channel_id, 2);
        assert_eq!(invocation.selector().as_deref(), Some("_doSomething:"));

        let reply = DtxMessage::raw_archive(2, invocation.message_id, 1, b"ok".to_vec(), false);
        peer.write_all(&reply.serialize()).await.unwrap();
        peer.flush().await.unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result.unwrap().payload, b"ok".to_vec());
    }

    #[tokio::test]
    async fn notification_dispatches_to_registered_selector() {
        let (conn, mut peer) = connected_pair().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        conn.on("_XCT_logDebugMessage:", move |msg| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(msg);
            }
        });

        let notification = DtxMessage::invocation(
            0,
            9999,
            0,
            "_XCT_logDebugMessage:",
            AuxBuffer::new(),
            false,
        )
        .unwrap();
        peer.write_all(&notification.serialize()).await.unwrap();
        peer.flush().await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.selector().as_deref(), Some("_XCT_logDebugMessage:"));
    }

    #[tokio::test]
    async fn close_fires_finished_and_cancels_pending_calls() {
        let (conn, _peer) = connected_pair().await;

        let call = tokio::spawn({
            let conn = conn.clone();
            async move {
                conn.call_with_timeout(
                    3,
                    "_neverReplied:",
                    AuxBuffer::new(),
                    true,
                    Duration::from_secs(5),
                )
                .await
            }
        });

        tokio::task::yield_now().await;
        conn.close();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(IdeviceError::Cancelled)));
        conn.wait_finished().await;
    }
}
