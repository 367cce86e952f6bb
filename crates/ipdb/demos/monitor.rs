//! Print every change the database applies.
//!
//! Run with: cargo run -p ipdb --example monitor
//!
//! Then in another terminal, try:
//!   ip link add dummy test0 type dummy
//!   ip addr add 10.0.0.1/24 dev test0
//!   ip link set test0 up
//!   ip link del test0

use ipdb::netlink::NlMsgType;
use ipdb::{Config, Ipdb, Mode};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ipdb::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let ipdb = Ipdb::new(Config::from_env().mode(Mode::Snapshot)).await?;
    for (index, iface) in ipdb.interfaces() {
        println!(
            "{index}: {} {:?}",
            iface.ifname().unwrap_or_default(),
            iface.ipaddr()
        );
    }
    println!("\nMonitoring (Ctrl+C to stop)...\n");

    let mut events = Box::pin(ipdb.events());
    while let Some(msg) = events.next().await {
        match msg.msg_type() {
            NlMsgType::RTM_NEWLINK | NlMsgType::RTM_DELLINK => {
                let index = msg.field_or_zero("index") as u32;
                let state = match ipdb.by_index(index) {
                    Some(iface) => format!("{:?} {}", iface.status(), iface.to_json()),
                    None => "gone".to_string(),
                };
                println!("[LINK] {index}: {state}");
            }
            NlMsgType::RTM_NEWADDR | NlMsgType::RTM_DELADDR => {
                let index = msg.field_or_zero("index") as u32;
                println!("[ADDR] {index}: {:?}", ipdb.addresses(index));
            }
            NlMsgType::RTM_NEWROUTE | NlMsgType::RTM_DELROUTE => {
                for table in ipdb.routes().tables() {
                    println!("[ROUTE] table {table}: {} routes", ipdb.routes().table(table).len());
                }
            }
            _ => println!("[OTHER] {msg}"),
        }
    }
    Ok(())
}
