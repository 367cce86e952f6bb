//! Route table tests against the in-memory kernel.

use ipdb::rtnl::route::RT_TABLE_MAIN;
use ipdb::{Error, Interface, Ipdb, Result, Status, Value};

use crate::common::{FakeKernel, config};

async fn uplink(ipdb: &Ipdb) -> Result<Interface> {
    let dummy = ipdb
        .create("dummy", "up0")
        .add_ip("10.0.0.1/24")
        .commit()
        .await?;
    dummy.up().await?;
    dummy.commit().await?;
    Ok(dummy)
}

#[tokio::test]
async fn test_add_route() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let uplink = uplink(&ipdb).await?;

    let route = ipdb.routes().add([
        ("dst", Value::from("10.1.0.0/24")),
        ("gateway", Value::from("10.0.0.254")),
        ("oif", Value::from(uplink.index())),
    ])?;
    assert_eq!(route.status(), Status::Pending);
    route.commit().await?;

    assert_eq!(route.status(), Status::Active);
    assert_eq!(kernel.state().routes.len(), 1);
    assert_eq!(ipdb.routes().tables(), vec![RT_TABLE_MAIN]);

    let found = ipdb.routes().get("10.1.0.0/24")?.expect("route in main table");
    assert_eq!(found.get("gateway"), Some(Value::from("10.0.0.254")));
    assert_eq!(found.key().map(|k| k.oif), Some(uplink.index()));
    Ok(())
}

#[tokio::test]
async fn test_route_needs_dst() -> Result<()> {
    let (ipdb, _kernel) = FakeKernel::open(config()).await?;

    let err = ipdb
        .routes()
        .add([("gateway", Value::from("10.0.0.254"))])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAttribute(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn test_change_route_gateway() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    uplink(&ipdb).await?;

    let route = ipdb
        .routes()
        .add([("dst", "10.1.0.0/24"), ("gateway", "10.0.0.254")])?;
    route.commit().await?;

    route.set("gateway", "10.0.0.253").await?;
    route.commit().await?;

    assert_eq!(route.get("gateway"), Some(Value::from("10.0.0.253")));
    let state = kernel.state();
    assert_eq!(state.routes.len(), 1);
    assert_eq!(
        state.routes[0].attr_ip("RTA_GATEWAY").map(|ip| ip.to_string()),
        Some("10.0.0.253".to_string())
    );
    Ok(())
}

#[tokio::test]
async fn test_remove_route() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    uplink(&ipdb).await?;

    let route = ipdb.routes().add([("dst", "10.1.0.0/24"), ("gateway", "10.0.0.254")])?;
    route.commit().await?;

    route.remove().await?;
    route.commit().await?;

    assert!(ipdb.routes().get("10.1.0.0/24")?.is_none());
    assert!(kernel.state().routes.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_remove_missing_route_reports_esrch() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    uplink(&ipdb).await?;

    let route = ipdb.routes().add([("dst", "10.1.0.0/24"), ("gateway", "10.0.0.254")])?;
    route.commit().await?;

    // Gone from the kernel without a notification.
    kernel.state().routes.clear();

    route.remove().await?;
    let err = route.commit().await.unwrap_err();
    assert!(err.is_errno(libc::ESRCH), "got {err:?}");
    assert!(ipdb.routes().get("10.1.0.0/24")?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_duplicate_route_fails() -> Result<()> {
    let (ipdb, _kernel) = FakeKernel::open(config()).await?;
    uplink(&ipdb).await?;

    ipdb.routes()
        .add([("dst", "10.1.0.0/24"), ("gateway", "10.0.0.254")])?
        .commit()
        .await?;
    let err = ipdb
        .routes()
        .add([("dst", "10.1.0.0/24"), ("gateway", "10.0.0.253")])?
        .commit()
        .await
        .unwrap_err();
    assert!(err.is_already_exists(), "got {err:?}");
    assert_eq!(ipdb.routes().table(RT_TABLE_MAIN).len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_large_dump_spans_datagrams() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    kernel.state().insert_routes(300);

    ipdb.refresh().await?;
    assert_eq!(ipdb.routes().table(RT_TABLE_MAIN).len(), 300);
    assert!(ipdb.routes().get("10.101.43.0/24")?.is_some());
    Ok(())
}
