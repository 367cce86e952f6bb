//! Transactional database of Linux network configuration.
//!
//! The crate has two layers:
//!
//! - [`netlink`] and [`rtnl`]: an async netlink client. Messages are
//!   generic values described by static schemas; [`rtnl`] adds the route
//!   family (links, addresses, routes, rules, neighbours, traffic control)
//!   and request builders for them.
//! - [`db`]: [`Ipdb`], a live mirror of the kernel's configuration kept
//!   current by RTNL notifications. Interfaces and routes are changed
//!   inside transactions; `commit()` applies the difference and waits for
//!   the kernel to confirm it, rolling back on failure.
//!
//! # Example
//!
//! ```ignore
//! use ipdb::{Config, Ipdb};
//!
//! #[tokio::main]
//! async fn main() -> ipdb::Result<()> {
//!     let ipdb = Ipdb::new(Config::from_env()).await?;
//!
//!     let lo = ipdb.by_name("lo").expect("loopback");
//!     println!("lo: {}", lo.to_json());
//!
//!     let br = ipdb.create("bridge", "br0").commit().await?;
//!     br.add_ip("10.0.0.1/24").await?;
//!     br.up().await?;
//!     br.commit().await?;
//!
//!     ipdb.release();
//!     Ok(())
//! }
//! ```
//!
//! # Event Monitoring
//!
//! ```ignore
//! use tokio_stream::StreamExt;
//!
//! let mut events = Box::pin(ipdb.events());
//! while let Some(msg) = events.next().await {
//!     println!("{msg}");
//! }
//! ```

pub mod config;
pub mod db;
pub mod netlink;
pub mod rtnl;
pub mod value;

pub use config::{Config, Mode};
pub use db::{
    CallbackId, Changes, CreateBuilder, Interface, Ipdb, LinkRef, Route, Routes, Sid, Status, Tid,
};
pub use netlink::{Connection, Error, Message, NetNsFlags, Protocol, Result};
pub use value::Value;
