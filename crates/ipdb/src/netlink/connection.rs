//! Request/response multiplexing over a netlink endpoint.
//!
//! A [`Connection`] may be shared between tasks. Every request gets its own
//! sequence number and its replies are filed under it, so concurrent
//! requests never see each other's messages. Anything that is not a reply
//! to a pending request lands in the broadcast queue read by
//! [`Connection::recv`].
//!
//! Only one task reads the endpoint at a time. Whoever holds the reader
//! lock files every message it reads and wakes all waiters; the others
//! sleep until either their reply shows up or the reader lock frees up.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::channel::ChannelEndpoint;
use super::codec::Message;
use super::error::{Error, Result};
use super::message::{MessageIter, NLM_F_ACK, NLM_F_DUMP, NLM_F_ECHO, NLM_F_REQUEST, NlMsgType};
use super::namespace::{NetNs, NetNsFlags};
use super::proxy::Proxy;
use super::schema::Registry;
use super::socket::{NetlinkSocket, Protocol};

/// Default time to wait for the replies to one request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Broadcast messages kept when nobody reads them.
const BROADCAST_LIMIT: usize = 16 * 1024;

/// Where datagrams go to and come from.
#[derive(Debug)]
pub enum Endpoint {
    /// A socket in the current namespace.
    Kernel(NetlinkSocket),
    /// A socket owned by a worker inside another namespace.
    NetNs(NetNs),
    /// An in-memory peer.
    Channel(ChannelEndpoint),
}

impl Endpoint {
    fn pid(&self) -> u32 {
        match self {
            Endpoint::Kernel(s) => s.pid(),
            Endpoint::NetNs(n) => n.pid(),
            Endpoint::Channel(c) => c.pid(),
        }
    }

    async fn send(&self, data: Vec<u8>) -> Result<()> {
        match self {
            Endpoint::Kernel(s) => s.send(&data).await,
            Endpoint::NetNs(n) => n.send(data).await,
            Endpoint::Channel(c) => c.send(&data),
        }
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        match self {
            Endpoint::Kernel(s) => s.recv_msg().await,
            Endpoint::NetNs(n) => n.recv().await,
            Endpoint::Channel(c) => c.recv().await,
        }
    }

    async fn bind(&self, groups: u64) -> Result<()> {
        match self {
            Endpoint::Kernel(s) => s.add_groups(groups),
            Endpoint::NetNs(n) => n.bind(groups).await,
            Endpoint::Channel(c) => {
                c.bind(groups);
                Ok(())
            }
        }
    }

    fn close(&self) {
        if let Endpoint::NetNs(n) = self {
            n.close();
        }
    }

    fn closed_error(&self) -> Error {
        match self {
            Endpoint::NetNs(_) => Error::Cancelled,
            _ => Error::SocketClosed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    expects_data: bool,
    dump: bool,
}

#[derive(Debug, Default)]
struct Backlog {
    pending: HashMap<u32, Pending>,
    replies: HashMap<u32, VecDeque<Message>>,
    broadcast: VecDeque<Message>,
}

impl Backlog {
    fn file(&mut self, msg: Message, pid: u32) {
        let seq = msg.seq();
        let control = msg.header.is_error() || msg.header.is_done() || msg.header.is_multi();
        if seq != 0 && msg.header.nlmsg_pid == pid {
            match self.pending.get(&seq) {
                Some(p) if control || p.expects_data => {
                    self.replies.entry(seq).or_default().push_back(msg);
                    return;
                }
                None if control => {
                    trace!(seq, "dropping reply to a finished request");
                    return;
                }
                _ => {}
            }
        }
        if self.broadcast.len() >= BROADCAST_LIMIT {
            warn!("broadcast backlog full, dropping oldest message");
            self.broadcast.pop_front();
        }
        self.broadcast.push_back(msg);
    }
}

struct Inner {
    endpoint: Endpoint,
    registry: &'static Registry,
    seq: AtomicU32,
    backlog: Mutex<Backlog>,
    arrived: Notify,
    reader: tokio::sync::Mutex<()>,
    proxy: RwLock<Option<Arc<Proxy>>>,
    closed: AtomicBool,
}

impl Inner {
    fn backlog(&self) -> MutexGuard<'_, Backlog> {
        self.backlog.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn proxy(&self) -> Option<Arc<Proxy>> {
        self.proxy.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn next_seq(&self) -> u32 {
        loop {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.endpoint.closed_error());
        }
        Ok(())
    }

    fn forget(&self, seq: u32) {
        let mut backlog = self.backlog();
        backlog.pending.remove(&seq);
        backlog.replies.remove(&seq);
    }

    /// Read one datagram and file its messages.
    async fn read_once(&self) -> Result<()> {
        let data = self.endpoint.recv().await?;
        let proxy = self.proxy();

        let mut messages = Vec::new();
        for raw in MessageIter::new(&data) {
            let raw = match raw {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "dropping rest of malformed datagram");
                    break;
                }
            };
            match Message::decode(raw, self.registry) {
                Ok(mut msg) => {
                    if let Some(proxy) = &proxy {
                        proxy.enrich(&mut msg);
                    }
                    trace!(%msg, "received");
                    messages.push(msg);
                }
                Err(e) => warn!(error = %e, "dropping undecodable message"),
            }
        }

        let pid = self.endpoint.pid();
        {
            let mut backlog = self.backlog();
            for msg in messages {
                backlog.file(msg, pid);
            }
        }
        self.arrived.notify_waiters();
        Ok(())
    }

    async fn read_guarded(&self) -> Result<()> {
        let _reader = self.reader.lock().await;
        self.check_open()?;
        self.read_once().await
    }

    /// Collect the replies filed under `seq` until the request completes.
    async fn gather(&self, seq: u32, dump: bool) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut backlog = self.backlog();
                if let Some(queue) = backlog.replies.get_mut(&seq) {
                    while let Some(msg) = queue.pop_front() {
                        if let Some(code) = msg.error_code() {
                            if code != 0 {
                                return Err(Error::from_errno(code));
                            }
                            if !dump {
                                return Ok(out);
                            }
                            continue;
                        }
                        if msg.header.is_done() {
                            let code = done_code(&msg);
                            if code < 0 {
                                return Err(Error::from_errno(code));
                            }
                            return Ok(out);
                        }
                        out.push(msg);
                    }
                }
            }

            self.check_open()?;
            tokio::select! {
                _ = &mut notified => {}
                read = self.read_guarded() => read?,
            }
        }
    }
}

fn done_code(msg: &Message) -> i32 {
    msg.trailer
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_ne_bytes)
        .unwrap_or(0)
}

/// Unregisters a pending request when the waiter goes away.
struct PendingGuard<'a> {
    inner: &'a Inner,
    seq: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.forget(self.seq);
    }
}

struct Shared {
    inner: Arc<Inner>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
    }
}

/// Shared netlink connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    timeout: Duration,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.inner().endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Connection {
    /// Open a kernel socket for the given protocol.
    pub fn new(protocol: Protocol) -> Result<Self> {
        let socket = NetlinkSocket::new(protocol)?;
        Ok(Self::from_endpoint(
            Endpoint::Kernel(socket),
            super::registry(protocol),
        ))
    }

    /// Open a kernel socket with an explicit receive buffer.
    pub fn with_rcvbuf(protocol: Protocol, rcvbuf: usize) -> Result<Self> {
        let socket = NetlinkSocket::with_rcvbuf(protocol, rcvbuf)?;
        Ok(Self::from_endpoint(
            Endpoint::Kernel(socket),
            super::registry(protocol),
        ))
    }

    /// Talk rtnetlink inside a named namespace.
    pub async fn for_netns(name: &str, flags: NetNsFlags) -> Result<Self> {
        let netns = NetNs::open(name, flags).await?;
        Ok(Self::from_endpoint(
            Endpoint::NetNs(netns),
            super::registry(Protocol::Route),
        ))
    }

    /// Talk to an in-memory peer.
    pub fn from_channel(endpoint: ChannelEndpoint, registry: &'static Registry) -> Self {
        Self::from_endpoint(Endpoint::Channel(endpoint), registry)
    }

    pub fn from_endpoint(endpoint: Endpoint, registry: &'static Registry) -> Self {
        let inner = Inner {
            endpoint,
            registry,
            seq: AtomicU32::new(1),
            backlog: Mutex::new(Backlog::default()),
            arrived: Notify::new(),
            reader: tokio::sync::Mutex::new(()),
            proxy: RwLock::new(None),
            closed: AtomicBool::new(false),
        };
        Self {
            shared: Arc::new(Shared {
                inner: Arc::new(inner),
                pump: Mutex::new(None),
            }),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use a different reply timeout for this handle.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn inner(&self) -> &Inner {
        &self.shared.inner
    }

    /// Port id used in outgoing headers.
    pub fn pid(&self) -> u32 {
        self.inner().endpoint.pid()
    }

    /// Registry used to decode incoming messages.
    pub fn registry(&self) -> &'static Registry {
        self.inner().registry
    }

    /// Install (or remove) the send/recv proxy.
    pub fn set_proxy(&self, proxy: Option<Arc<Proxy>>) {
        *self.inner().proxy.write().unwrap_or_else(|e| e.into_inner()) = proxy;
    }

    pub fn is_closed(&self) -> bool {
        self.inner().closed.load(Ordering::Acquire)
    }

    /// Subscribe to multicast groups.
    ///
    /// With `pump`, a background task keeps reading the endpoint so
    /// broadcasts are queued even while no request is in flight.
    pub async fn bind(&self, groups: u64, pump: bool) -> Result<()> {
        let inner = self.inner();
        inner.check_open()?;
        inner.endpoint.bind(groups).await?;
        debug!(groups = format_args!("{groups:#x}"), pump, "bound multicast groups");

        if pump {
            let mut slot = self.shared.pump.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                let inner = Arc::clone(&self.shared.inner);
                *slot = Some(tokio::spawn(pump_loop(inner)));
            }
        }
        Ok(())
    }

    /// Send a message and register it as pending.
    ///
    /// Sequence and port id are assigned here. The returned sequence number
    /// must be passed to [`collect`](Self::collect) or
    /// [`forget`](Self::forget).
    pub async fn send(&self, mut msg: Message) -> Result<u32> {
        let inner = self.inner();
        inner.check_open()?;

        let seq = inner.next_seq();
        msg.header.nlmsg_seq = seq;
        msg.header.nlmsg_pid = inner.endpoint.pid();

        let flags = msg.header.nlmsg_flags;
        let get = NlMsgType::is_rtm_get(msg.msg_type());
        let pending = Pending {
            expects_data: get || flags & NLM_F_ECHO != 0,
            dump: get && flags & NLM_F_DUMP != 0,
        };
        inner.backlog().pending.insert(seq, pending);

        if let Some(proxy) = inner.proxy().filter(|p| p.handles(msg.msg_type())) {
            // Handlers may run ioctls or helper programs.
            let shared = Arc::clone(&self.shared.inner);
            let joined = tokio::task::spawn_blocking(move || {
                let forward = proxy.intercept(&mut msg, |replies| {
                    shared
                        .backlog()
                        .replies
                        .entry(seq)
                        .or_default()
                        .extend(replies);
                });
                (msg, forward)
            })
            .await;
            let forward = match joined {
                Ok((returned, forward)) => {
                    msg = returned;
                    forward
                }
                Err(e) => {
                    warn!(seq, error = %e, "proxy handler did not finish");
                    inner.forget(seq);
                    return Err(Error::Cancelled);
                }
            };
            match forward {
                Ok(true) => {}
                Ok(false) => {
                    inner.arrived.notify_waiters();
                    return Ok(seq);
                }
                Err(e) => {
                    inner.forget(seq);
                    return Err(e);
                }
            }
        }

        trace!(%msg, "sending");
        let data = match msg.try_encode() {
            Ok(data) => data,
            Err(e) => {
                inner.forget(seq);
                return Err(e);
            }
        };
        if let Err(e) = inner.endpoint.send(data).await {
            inner.forget(seq);
            return Err(e);
        }
        Ok(seq)
    }

    /// Wait for every reply to a request sent with [`send`](Self::send).
    pub async fn collect(&self, seq: u32) -> Result<Vec<Message>> {
        let inner = self.inner();
        let dump = inner
            .backlog()
            .pending
            .get(&seq)
            .map(|p| p.dump)
            .ok_or_else(|| Error::InvalidMessage(format!("no request pending for seq {seq}")))?;
        let _guard = PendingGuard { inner, seq };

        match tokio::time::timeout(self.timeout, inner.gather(seq, dump)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(self.timeout)),
        }
    }

    /// Drop a pending request without waiting for it.
    pub fn forget(&self, seq: u32) {
        self.inner().forget(seq);
    }

    /// Send with `NLM_F_REQUEST | NLM_F_ACK` and wait for completion.
    ///
    /// Data replies (for `GET` requests or `NLM_F_ECHO`) are returned; a
    /// plain ACK yields an empty list.
    pub async fn request(&self, mut msg: Message) -> Result<Vec<Message>> {
        msg.header.nlmsg_flags |= NLM_F_REQUEST | NLM_F_ACK;
        let seq = self.send(msg).await?;
        self.collect(seq).await
    }

    /// Send with `NLM_F_REQUEST | NLM_F_DUMP` and collect until `NLMSG_DONE`.
    pub async fn dump(&self, mut msg: Message) -> Result<Vec<Message>> {
        msg.header.nlmsg_flags |= NLM_F_REQUEST | NLM_F_DUMP;
        let seq = self.send(msg).await?;
        self.collect(seq).await
    }

    /// Next broadcast message.
    pub async fn recv(&self) -> Result<Message> {
        let inner = self.inner();
        loop {
            let notified = inner.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = inner.backlog().broadcast.pop_front() {
                return Ok(msg);
            }
            inner.check_open()?;
            tokio::select! {
                _ = &mut notified => {}
                read = inner.read_guarded() => read?,
            }
        }
    }

    /// Take every queued broadcast without waiting.
    pub fn drain(&self) -> Vec<Message> {
        self.inner().backlog().broadcast.drain(..).collect()
    }

    /// Close the connection. Waiters fail with [`Error::SocketClosed`]
    /// (or [`Error::Cancelled`] for namespace connections).
    pub fn close(&self) {
        let inner = self.inner();
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.endpoint.close();
        if let Some(pump) = self
            .shared
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            pump.abort();
        }
        inner.arrived.notify_waiters();
        debug!(pid = inner.endpoint.pid(), "connection closed");
    }
}

async fn pump_loop(inner: Arc<Inner>) {
    loop {
        if inner.check_open().is_err() {
            break;
        }
        match inner.read_guarded().await {
            Ok(()) => {}
            Err(Error::SocketClosed | Error::Cancelled) => break,
            Err(e) => warn!(error = %e, "broadcast pump read failed"),
        }
    }
    inner.arrived.notify_waiters();
}
