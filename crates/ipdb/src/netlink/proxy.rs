//! Request interception between a connection and its endpoint.
//!
//! A [`Proxy`] holds two handler tables keyed by message type. Outgoing
//! messages pass through the send table; the first handler that does not
//! answer [`Verdict::Forward`] decides the outcome, and its synthesized
//! replies are filed under the request's sequence number as if the kernel
//! had sent them. Incoming messages pass through the recv table, which may
//! enrich them in place.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use super::codec::Message;
use super::error::Result;

/// Outcome of a send handler.
#[derive(Debug)]
pub enum Verdict {
    /// Continue to the kernel, possibly after the handler modified the message.
    Forward,
    /// Answer with these messages instead of contacting the kernel.
    /// Sequence and port id are copied from the request.
    Return(Vec<Message>),
    /// Answer with an `NLMSG_ERROR` carrying this errno.
    Error(i32),
}

type SendHandler = Box<dyn Fn(&mut Message) -> Result<Verdict> + Send + Sync>;
type RecvHandler = Box<dyn Fn(&mut Message) + Send + Sync>;

/// Send and recv handler tables.
#[derive(Default)]
pub struct Proxy {
    send: HashMap<u16, Vec<SendHandler>>,
    recv: HashMap<u16, Vec<RecvHandler>>,
    lock: Mutex<()>,
    debug: bool,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("send", &self.send.keys().collect::<Vec<_>>())
            .field("recv", &self.recv.keys().collect::<Vec<_>>())
            .field("debug", &self.debug)
            .finish()
    }
}

impl Proxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trace every verdict at debug level.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Register a handler for outgoing messages of `msg_type`.
    pub fn on_send<F>(&mut self, msg_type: u16, handler: F)
    where
        F: Fn(&mut Message) -> Result<Verdict> + Send + Sync + 'static,
    {
        self.send
            .entry(msg_type)
            .or_default()
            .push(Box::new(handler));
    }

    /// Register a handler for incoming messages of `msg_type`.
    pub fn on_recv<F>(&mut self, msg_type: u16, handler: F)
    where
        F: Fn(&mut Message) + Send + Sync + 'static,
    {
        self.recv
            .entry(msg_type)
            .or_default()
            .push(Box::new(handler));
    }

    /// Whether any send handler is registered for `msg_type`.
    pub fn handles(&self, msg_type: u16) -> bool {
        self.send.get(&msg_type).is_some_and(|h| !h.is_empty())
    }

    /// Run the send table on `msg`.
    ///
    /// Handlers block; async callers run this on the blocking pool.
    ///
    /// Returns `true` when the message should go to the kernel. Otherwise
    /// the synthesized replies were handed to `inject` while the proxy lock
    /// was still held, so no other request can interleave between a
    /// handler's side effects and its reply.
    pub(crate) fn intercept<F>(&self, msg: &mut Message, inject: F) -> Result<bool>
    where
        F: FnOnce(Vec<Message>),
    {
        let Some(handlers) = self.send.get(&msg.msg_type()) else {
            return Ok(true);
        };
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        for handler in handlers {
            match handler(msg)? {
                Verdict::Forward => continue,
                Verdict::Return(mut replies) => {
                    for reply in &mut replies {
                        reply.header.nlmsg_seq = msg.header.nlmsg_seq;
                        reply.header.nlmsg_pid = msg.header.nlmsg_pid;
                    }
                    if self.debug {
                        debug!(%msg, replies = replies.len(), "proxy returned");
                    }
                    inject(replies);
                    return Ok(false);
                }
                Verdict::Error(errno) => {
                    if self.debug {
                        debug!(%msg, errno, "proxy error");
                    }
                    inject(vec![Message::error(errno, msg)]);
                    return Ok(false);
                }
            }
        }

        if self.debug {
            debug!(%msg, "proxy forwarded");
        }
        Ok(true)
    }

    /// Run the recv table on `msg`.
    pub(crate) fn enrich(&self, msg: &mut Message) {
        if let Some(handlers) = self.recv.get(&msg.msg_type()) {
            for handler in handlers {
                handler(msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::schema::OPAQUE_SCHEMA;

    fn request(msg_type: u16) -> Message {
        let mut msg = Message::new(&OPAQUE_SCHEMA, msg_type, 0x5);
        msg.header.nlmsg_seq = 11;
        msg.header.nlmsg_pid = 99;
        msg
    }

    #[test]
    fn test_unhandled_type_forwards() {
        let proxy = Proxy::new();
        let mut msg = request(16);
        assert!(proxy.intercept(&mut msg, |_| panic!("no inject")).unwrap());
    }

    #[test]
    fn test_error_verdict_echoes_request() {
        let mut proxy = Proxy::new();
        proxy.on_send(16, |_| Ok(Verdict::Forward));
        proxy.on_send(16, |_| Ok(Verdict::Error(libc::EPERM)));

        let mut msg = request(16);
        let mut injected = Vec::new();
        let forward = proxy.intercept(&mut msg, |r| injected = r).unwrap();
        assert!(!forward);
        assert_eq!(injected.len(), 1);
        assert_eq!(injected[0].error_code(), Some(-libc::EPERM));
        assert_eq!(injected[0].seq(), 11);
        assert_eq!(injected[0].trailer, msg.encode());
    }

    #[test]
    fn test_return_verdict_stamps_sequence() {
        let mut proxy = Proxy::new();
        proxy.on_send(16, |m| Ok(Verdict::Return(vec![Message::error(0, m)])));

        let mut msg = request(16);
        let mut injected = Vec::new();
        proxy.intercept(&mut msg, |r| injected = r).unwrap();
        assert_eq!(injected[0].header.nlmsg_pid, 99);
        assert_eq!(injected[0].error_code(), Some(0));
    }

    #[test]
    fn test_handles() {
        let mut proxy = Proxy::new();
        proxy.on_send(16, |_| Ok(Verdict::Forward));
        assert!(proxy.handles(16));
        assert!(!proxy.handles(17));
    }

    #[test]
    fn test_recv_enrichment() {
        let mut proxy = Proxy::new();
        proxy.on_recv(16, |m| m.trailer.push(7));
        let mut msg = request(16);
        proxy.enrich(&mut msg);
        assert_eq!(msg.trailer, vec![7]);
    }
}
