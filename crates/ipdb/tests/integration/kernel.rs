//! Tests against the real kernel inside a throwaway namespace.

use std::time::Duration;

use ipdb::{Error, Result, Status, Value};

use crate::common::{TestNamespace, eventually};

#[tokio::test]
async fn test_veth_pair_in_namespace() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("veth")?;
    let ipdb = ns.ipdb().await?;

    let veth = ipdb
        .create("veth", "v0p0")
        .peer("v0p1")
        .add_ip("10.0.0.1/24")
        .commit()
        .await?;
    veth.up().await?;
    veth.commit().await?;

    let peer = ipdb.wait_interface("v0p1", Duration::from_secs(1)).await?;
    assert_eq!(peer.kind().as_deref(), Some("veth"));
    assert!(veth.ipaddr().contains(&("10.0.0.1".parse().unwrap(), 24)));

    veth.remove().await?;
    veth.commit().await?;
    assert!(ipdb.by_name("v0p0").is_none());
    Ok(())
}

#[tokio::test]
async fn test_bridge_with_port() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("bridge")?;
    let ipdb = ns.ipdb().await?;

    let port = ipdb.create("dummy", "d0").commit().await?;
    let bridge = ipdb.create("bridge", "br0").add_port(&port).commit().await?;
    assert!(bridge.ports().contains(&port.index()));
    assert_eq!(port.get("master"), Some(Value::from(bridge.index())));
    Ok(())
}

#[tokio::test]
async fn test_failed_commit_restores_mtu() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("rollback")?;
    let ipdb = ns.ipdb().await?;
    let dummy = ipdb.create("dummy", "d0").commit().await?;
    let mtu = dummy.get("mtu");

    dummy.set("mtu", 1400).await?;
    // Adding to a link that does not exist in the kernel fails.
    dummy.set("master", 999_999).await?;
    let err = dummy.commit().await.unwrap_err();
    assert!(matches!(err, Error::CommitFailed { .. }), "got {err:?}");
    assert_eq!(dummy.get("mtu"), mtu);
    Ok(())
}

#[tokio::test]
async fn test_route_removed_outside() -> Result<()> {
    require_root!();

    let ns = TestNamespace::new("route")?;
    let ipdb = ns.ipdb().await?;
    let dummy = ipdb.create("dummy", "d0").add_ip("10.0.0.1/24").commit().await?;
    dummy.up().await?;
    dummy.commit().await?;

    let route = ipdb.routes().add([
        ("dst", Value::from("10.1.0.0/24")),
        ("gateway", Value::from("10.0.0.254")),
    ])?;
    route.commit().await?;

    ipdb.connection()
        .del_route(&ipdb::rtnl::RouteRequest::to("10.1.0.0/24")?)
        .await?;
    let gone = eventually(|| {
        ipdb.routes()
            .get("10.1.0.0/24")
            .is_ok_and(|route| route.is_none())
    })
    .await;
    assert!(gone, "route removed outside the database should vanish");
    assert_eq!(route.status(), Status::Removed);
    Ok(())
}
