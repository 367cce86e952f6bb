//! Async netlink transport.
//!
//! Messages are described by static schemas and handled as generic
//! [`Message`] values: fixed header fields plus a tree of named attributes.
//! The same codec serves every protocol; only the [`Registry`] differs.
//!
//! # Quick Start
//!
//! ```ignore
//! use ipdb::netlink::{Connection, Protocol};
//! use ipdb::rtnl;
//!
//! let conn = Connection::new(Protocol::Route)?;
//! for link in conn.get_links().await? {
//!     println!("{}: {:?}", link.field_or_zero("index"), link.attr_str("IFLA_IFNAME"));
//! }
//! ```
//!
//! # Namespaces
//!
//! ```ignore
//! use ipdb::netlink::{Connection, NetNsFlags};
//!
//! let conn = Connection::for_netns("test", NetNsFlags::create()).await?;
//! let links = conn.get_links().await?;
//! ```

pub mod attr;
pub mod builder;
pub mod channel;
pub mod codec;
pub mod connection;
mod error;
pub mod message;
pub mod namespace;
pub mod proxy;
pub mod schema;
pub mod socket;

pub use codec::{AttrValue, Attribute, Body, Message, Record};
pub use connection::{Connection, Endpoint};
pub use error::{Error, Result};
pub use message::{NlMsgHdr, NlMsgType};
pub use namespace::{NetNs, NetNsFlags};
pub use proxy::{Proxy, Verdict};
pub use schema::Registry;
pub use socket::{Protocol, rtnetlink_groups};

/// Schema registry for a protocol.
pub fn registry(protocol: Protocol) -> &'static Registry {
    match protocol {
        Protocol::Route => &crate::rtnl::REGISTRY,
        Protocol::Generic => &schema::CONTROL_REGISTRY,
    }
}
