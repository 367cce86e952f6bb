//! Low-level async netlink socket operations.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use bytes::BytesMut;
use netlink_sys::{Socket, SocketAddr, protocols};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tracing::trace;

use super::error::{Error, Result};

/// Smallest receive buffer the socket will use.
pub const MIN_RCVBUF: usize = 16 * 1024;

/// Default receive buffer size.
pub const DEFAULT_RCVBUF: usize = 32 * 1024;

/// Netlink protocol families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Routing/device hook (links, addresses, routes, tc, ...).
    Route,
    /// Generic netlink.
    Generic,
}

impl Protocol {
    fn as_isize(self) -> isize {
        match self {
            Protocol::Route => protocols::NETLINK_ROUTE,
            Protocol::Generic => protocols::NETLINK_GENERIC,
        }
    }
}

/// Async netlink socket.
pub struct NetlinkSocket {
    fd: AsyncFd<Socket>,
    pid: u32,
    bufsize: usize,
    protocol: Protocol,
}

impl NetlinkSocket {
    /// Create a new netlink socket for the given protocol.
    ///
    /// The socket is bound to a kernel-assigned port id and subscribed to no
    /// groups.
    pub fn new(protocol: Protocol) -> Result<Self> {
        Self::with_rcvbuf(protocol, DEFAULT_RCVBUF)
    }

    /// Create a socket with an explicit receive buffer size.
    pub fn with_rcvbuf(protocol: Protocol, bufsize: usize) -> Result<Self> {
        let mut socket = Socket::new(protocol.as_isize())?;
        socket.set_non_blocking(true)?;

        let mut addr = SocketAddr::new(0, 0);
        socket.bind(&addr)?;
        socket.get_address(&mut addr)?;
        let pid = addr.port_number();

        // Extended ACK is best effort; old kernels reject the option.
        socket.set_ext_ack(true).ok();

        let bufsize = bufsize.max(MIN_RCVBUF);
        set_int_opt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            bufsize as libc::c_int,
        )?;

        let fd = AsyncFd::new(socket)?;

        Ok(Self {
            fd,
            pid,
            bufsize,
            protocol,
        })
    }

    /// Get the local port ID.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Get the protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Get the receive buffer size.
    pub fn bufsize(&self) -> usize {
        self.bufsize
    }

    /// Subscribe to a multicast group.
    pub fn add_membership(&self, group: u32) -> Result<()> {
        set_int_opt(
            self.as_raw_fd(),
            libc::SOL_NETLINK,
            libc::NETLINK_ADD_MEMBERSHIP,
            group as libc::c_int,
        )
    }

    /// Subscribe to every group set in a bitmask (bit `n - 1` is group `n`).
    pub fn add_groups(&self, mask: u64) -> Result<()> {
        for group in 1..=64u32 {
            if mask & (1u64 << (group - 1)) != 0 {
                self.add_membership(group)?;
            }
        }
        Ok(())
    }

    /// Send a message.
    pub async fn send(&self, msg: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;

            match guard.try_io(|inner| inner.get_ref().send(msg, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one datagram.
    ///
    /// The pending datagram is peeked first so the buffer can grow past
    /// `bufsize` for oversized dumps; a read that still comes back short
    /// is reported as [`Error::MessageTruncated`].
    pub async fn recv_msg(&self) -> Result<Vec<u8>> {
        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;

            let size = match guard.try_io(|inner| peek_len(inner.get_ref().as_raw_fd())) {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };

            let capacity = size.max(self.bufsize);
            let mut buf = BytesMut::with_capacity(capacity);
            match guard.try_io(|inner| inner.get_ref().recv(&mut buf, 0)) {
                Ok(result) => {
                    let n = result?;
                    if n < size {
                        return Err(Error::MessageTruncated { size, capacity: n });
                    }
                    trace!(size = n, pid = self.pid, "netlink datagram");
                    return Ok(buf.to_vec());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

impl std::fmt::Debug for NetlinkSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetlinkSocket")
            .field("pid", &self.pid)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

fn peek_len(fd: RawFd) -> io::Result<usize> {
    // SAFETY: a zero-length read into a null buffer is valid; MSG_TRUNC makes
    // the kernel report the real datagram size.
    let n = unsafe {
        libc::recv(
            fd,
            std::ptr::null_mut(),
            0,
            libc::MSG_PEEK | libc::MSG_TRUNC,
        )
    };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn set_int_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> Result<()> {
    // SAFETY: value lives for the duration of the call and its size is passed.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

/// Multicast groups for NETLINK_ROUTE.
pub mod rtnetlink_groups {
    pub const RTNLGRP_LINK: u32 = 1;
    pub const RTNLGRP_NOTIFY: u32 = 2;
    pub const RTNLGRP_NEIGH: u32 = 3;
    pub const RTNLGRP_TC: u32 = 4;
    pub const RTNLGRP_IPV4_IFADDR: u32 = 5;
    pub const RTNLGRP_IPV4_ROUTE: u32 = 7;
    pub const RTNLGRP_IPV4_RULE: u32 = 8;
    pub const RTNLGRP_IPV6_IFADDR: u32 = 9;
    pub const RTNLGRP_IPV6_ROUTE: u32 = 11;
    pub const RTNLGRP_IPV6_PREFIX: u32 = 18;
    pub const RTNLGRP_IPV6_RULE: u32 = 19;

    /// Turn a list of groups into a subscription bitmask.
    pub const fn mask(groups: &[u32]) -> u64 {
        let mut mask = 0u64;
        let mut i = 0;
        while i < groups.len() {
            mask |= 1u64 << (groups[i] - 1);
            i += 1;
        }
        mask
    }

    /// Groups the database listens to.
    pub const DEFAULT: u64 = mask(&[
        RTNLGRP_LINK,
        RTNLGRP_NOTIFY,
        RTNLGRP_NEIGH,
        RTNLGRP_TC,
        RTNLGRP_IPV4_IFADDR,
        RTNLGRP_IPV4_ROUTE,
        RTNLGRP_IPV6_IFADDR,
        RTNLGRP_IPV6_ROUTE,
        RTNLGRP_IPV6_PREFIX,
        RTNLGRP_IPV4_RULE,
    ]);
}

#[cfg(test)]
mod tests {
    use super::rtnetlink_groups::*;

    #[test]
    fn test_group_mask() {
        assert_eq!(mask(&[RTNLGRP_LINK]), 1);
        assert_eq!(mask(&[RTNLGRP_LINK, RTNLGRP_IPV4_ROUTE]), 0b100_0001);
        assert_ne!(DEFAULT & (1 << (RTNLGRP_IPV6_PREFIX - 1)), 0);
        assert_eq!(DEFAULT & (1 << (RTNLGRP_IPV6_RULE - 1)), 0);
    }
}
