//! Create a veth pair with addresses and bring it up in one commit.
//!
//! Run with: sudo cargo run -p ipdb --example veth_pair -- v0p0 v0p1
//!
//! Set `RUST_LOG=ipdb=debug` to follow the commit.

use std::env;

use ipdb::{Config, Ipdb};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ipdb::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args: Vec<String> = env::args().collect();
    let name = args.get(1).map(String::as_str).unwrap_or("v0p0");
    let peer = args.get(2).map(String::as_str).unwrap_or("v0p1");

    let ipdb = Ipdb::new(Config::from_env()).await?;

    let veth = ipdb
        .create("veth", name)
        .peer(peer)
        .add_ip("10.0.0.1/24")
        .commit()
        .await?;
    veth.up().await?;
    veth.commit().await?;
    println!("{}", serde_json::to_string_pretty(&veth.to_json())?);

    let other = ipdb.by_name(peer).expect("peer is created with the pair");
    other.add_ip("10.0.0.2/24").await?;
    other.up().await?;
    if let Err(e) = other.commit().await {
        eprintln!("configuring {peer} failed and was rolled back: {e}");
    }

    println!("press Enter to remove the pair");
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;

    veth.remove().await?;
    veth.commit().await?;
    ipdb.release();
    Ok(())
}
