//! Interface tests against the in-memory kernel.

use ipdb::netlink::NlMsgType;
use ipdb::rtnl::LinkExt;
use ipdb::rtnl::link::iff;
use ipdb::{Error, Mode, Result, Status, Value};

use crate::common::{FakeKernel, config, eventually};

#[tokio::test]
async fn test_load_mirrors_kernel() -> Result<()> {
    let (ipdb, _kernel) = FakeKernel::open(config()).await?;

    let lo = ipdb.by_name("lo").expect("lo should be loaded");
    assert_eq!(lo.index(), 1);
    assert_eq!(lo.status(), Status::Active);
    assert_eq!(lo.get("mtu"), Some(Value::Int(1500)));
    assert!(
        lo.ipaddr()
            .iter()
            .any(|(ip, prefix)| ip.to_string() == "127.0.0.1" && *prefix == 8)
    );
    assert_eq!(ipdb.names(), vec!["lo".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_create_veth_pair() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;

    let veth = ipdb
        .create("veth", "v0p0")
        .peer("v0p1")
        .add_ip("10.0.0.1/24")
        .commit()
        .await?;

    assert_eq!(veth.status(), Status::Active);
    assert_eq!(veth.kind().as_deref(), Some("veth"));
    assert!(ipdb.by_name("v0p1").is_some(), "peer should be tracked");

    let index = veth.index();
    assert_ne!(index, 0);
    assert!(kernel.state().has_address(index, "10.0.0.1/24"));
    assert!(veth.ipaddr().contains(&("10.0.0.1".parse().unwrap(), 24)));
    Ok(())
}

#[tokio::test]
async fn test_create_existing_name_fails() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;

    let err = ipdb.create("dummy", "lo").commit().await.unwrap_err();
    assert!(err.is_already_exists());
    assert_eq!(kernel.state().count(NlMsgType::RTM_NEWLINK), 0);
    Ok(())
}

#[tokio::test]
async fn test_unsupported_kind_leaves_nothing() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;

    let err = ipdb.create("nosuchkind", "x0").commit().await.unwrap_err();
    assert!(matches!(err, Error::CommitFailed { .. }), "got {err:?}");
    assert!(ipdb.by_name("x0").is_none());
    assert_eq!(kernel.state().count(NlMsgType::RTM_NEWLINK), 0);

    // The name is free again.
    ipdb.create("dummy", "x0").commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_commit_changes_link() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let dummy = ipdb.create("dummy", "d0").commit().await?;

    dummy.set("mtu", 1400).await?;
    dummy.up().await?;
    assert_eq!(dummy.pending("mtu"), Some(Value::Int(1400)));
    assert_eq!(dummy.get("mtu"), Some(Value::Int(1500)));
    dummy.commit().await?;

    assert_eq!(dummy.get("mtu"), Some(Value::Int(1400)));
    let state = kernel.state();
    let link = &state.links[&dummy.index()];
    assert_eq!(link.attr_u32("IFLA_MTU"), Some(1400));
    assert_ne!(link.link_flags() & iff::UP, 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_commit_rolls_back() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let dummy = ipdb.create("dummy", "d0").commit().await?;
    let index = dummy.index();

    dummy.set("mtu", 9000).await?;
    dummy.add_ip("10.1.0.1/24").await?;
    kernel.fail_next(NlMsgType::RTM_NEWADDR, libc::EPERM);

    let err = dummy.commit().await.unwrap_err();
    assert!(matches!(err, Error::CommitFailed { .. }), "got {err:?}");
    assert_eq!(err.root_errno(), Some(libc::EPERM));

    assert_eq!(kernel.state().links[&index].attr_u32("IFLA_MTU"), Some(1500));
    assert!(!kernel.state().has_address(index, "10.1.0.1/24"));
    assert_eq!(dummy.get("mtu"), Some(Value::Int(1500)));
    Ok(())
}

#[tokio::test]
async fn test_rollback_discards_changes() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let dummy = ipdb.create("dummy", "d0").commit().await?;
    let before = kernel.state().requests.len();

    dummy.set("mtu", 1280).await?;
    dummy.rollback()?;
    assert!(dummy.current_tx().is_none());
    assert_eq!(dummy.pending("mtu"), None);
    assert_eq!(dummy.get("mtu"), Some(Value::Int(1500)));
    assert_eq!(kernel.state().requests.len(), before);
    Ok(())
}

#[tokio::test]
async fn test_link_local_address_ignored() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let dummy = ipdb.create("dummy", "d0").commit().await?;

    dummy.add_ip("fe80::1/64").await?;
    dummy.commit().await?;
    assert_eq!(kernel.state().count(NlMsgType::RTM_NEWADDR), 0);
    Ok(())
}

#[tokio::test]
async fn test_strict_link_local_address_rejected() -> Result<()> {
    let (ipdb, _kernel) = FakeKernel::open(config().strict_addresses(true)).await?;
    let dummy = ipdb.create("dummy", "d0").commit().await?;

    let err = dummy.add_ip("fe80::1/64").await.unwrap_err();
    assert!(matches!(err, Error::InvalidAttribute(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn test_bridge_ports() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let port = ipdb.create("dummy", "d1").commit().await?;
    let bridge = ipdb.create("bridge", "br0").add_port("d1").commit().await?;

    assert!(bridge.ports().contains(&port.index()));
    assert_eq!(kernel.state().links[&port.index()].master(), bridge.index());

    bridge.del_port(&port).await?;
    bridge.commit().await?;
    assert!(bridge.ports().is_empty());
    assert_eq!(kernel.state().links[&port.index()].master(), 0);
    Ok(())
}

#[tokio::test]
async fn test_bridge_rejects_itself_as_port() -> Result<()> {
    let (ipdb, _kernel) = FakeKernel::open(config()).await?;
    let bridge = ipdb.create("bridge", "br0").commit().await?;

    assert!(bridge.add_port("br0").await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_remove_interface() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let dummy = ipdb.create("dummy", "d0").commit().await?;
    let index = dummy.index();

    dummy.remove().await?;
    dummy.commit().await?;

    assert!(ipdb.by_name("d0").is_none());
    assert!(!kernel.state().links.contains_key(&index));
    Ok(())
}

#[tokio::test]
async fn test_revert_to_snapshot() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let dummy = ipdb.create("dummy", "d0").commit().await?;
    let sid = dummy.snapshot();

    dummy.set("mtu", 1300).await?;
    dummy.add_ip("10.2.0.1/24").await?;
    dummy.commit().await?;
    assert!(kernel.state().has_address(dummy.index(), "10.2.0.1/24"));

    dummy.revert(sid).await?;
    assert_eq!(dummy.get("mtu"), Some(Value::Int(1500)));
    assert!(!kernel.state().has_address(dummy.index(), "10.2.0.1/24"));
    Ok(())
}

#[tokio::test]
async fn test_explicit_mode_needs_begin() -> Result<()> {
    let (ipdb, _kernel) = FakeKernel::open(config().mode(Mode::Explicit)).await?;
    let lo = ipdb.by_name("lo").expect("lo");

    let err = lo.set("mtu", 1400).await.unwrap_err();
    assert!(matches!(err, Error::NoTransaction), "got {err:?}");

    lo.begin()?;
    lo.set("mtu", 1400).await?;
    lo.commit().await?;
    assert_eq!(lo.get("mtu"), Some(Value::Int(1400)));
    Ok(())
}

#[tokio::test]
async fn test_direct_mode_applies_at_once() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config().mode(Mode::Direct)).await?;
    let lo = ipdb.by_name("lo").expect("lo");

    lo.set("mtu", 9000).await?;
    assert!(lo.current_tx().is_none());
    assert_eq!(kernel.state().links[&1].attr_u32("IFLA_MTU"), Some(9000));
    Ok(())
}

#[tokio::test]
async fn test_snapshot_mode_is_read_only() -> Result<()> {
    let (ipdb, _kernel) = FakeKernel::open(config().mode(Mode::Snapshot)).await?;

    let err = ipdb.create("dummy", "d0").commit().await.unwrap_err();
    assert!(matches!(err, Error::ReadOnly));
    let lo = ipdb.by_name("lo").expect("lo");
    assert!(matches!(lo.set("mtu", 1).await, Err(Error::ReadOnly)));
    Ok(())
}

#[tokio::test]
async fn test_frozen_interface_is_restored() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let dummy = ipdb.create("dummy", "d0").commit().await?;
    let index = dummy.index();
    dummy.freeze();

    kernel.set_link_attr(index, "IFLA_MTU", ipdb::netlink::AttrValue::U32(1300));
    let restored = eventually(|| {
        kernel.state().links[&index].attr_u32("IFLA_MTU") == Some(1500)
            && dummy.get("mtu") == Some(Value::Int(1500))
    })
    .await;
    assert!(restored, "frozen mtu should be restored");
    dummy.unfreeze();
    Ok(())
}

#[tokio::test]
async fn test_commit_hook_failure_rolls_back() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let dummy = ipdb.create("dummy", "d0").commit().await?;
    let id = dummy.register_commit_hook(|changes| {
        if changes.added.contains_key("mtu") {
            return Err(Error::InvalidAttribute("mtu is managed elsewhere".into()));
        }
        Ok(())
    });

    dummy.set("mtu", 1400).await?;
    assert!(dummy.commit().await.is_err());
    assert_eq!(kernel.state().links[&dummy.index()].attr_u32("IFLA_MTU"), Some(1500));

    assert!(dummy.unregister_commit_hook(id));
    dummy.set("mtu", 1400).await?;
    dummy.commit().await?;
    Ok(())
}

#[tokio::test]
async fn test_veth_without_peer_rejected() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;

    let err = ipdb.create("veth", "v9").commit().await.unwrap_err();
    assert!(matches!(err, Error::CommitFailed { .. }), "got {err:?}");
    assert!(ipdb.by_name("v9").is_none());
    assert_eq!(kernel.state().received(NlMsgType::RTM_NEWLINK), 0);
    Ok(())
}

#[tokio::test]
async fn test_default_device_created_behind_our_back() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    kernel.preempt_create("dummy0", "dummy");

    let dummy = ipdb.create("dummy", "dummy0").commit().await?;
    assert_eq!(dummy.status(), Status::Active);
    assert_eq!(kernel.state().index_of("dummy0"), Some(dummy.index()));
    Ok(())
}

#[tokio::test]
async fn test_strict_create_reports_default_device() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config().strict_create(true)).await?;
    kernel.preempt_create("dummy0", "dummy");

    let err = ipdb.create("dummy", "dummy0").commit().await.unwrap_err();
    assert_eq!(err.root_errno(), Some(libc::EEXIST), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn test_create_retries_without_index() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    kernel.fail_next(NlMsgType::RTM_NEWLINK, libc::EOPNOTSUPP);

    let dummy = ipdb.create("dummy", "d0").set("index", 50).commit().await?;
    assert_eq!(kernel.state().received(NlMsgType::RTM_NEWLINK), 2);
    assert_ne!(dummy.index(), 50);
    assert_ne!(dummy.index(), 0);
    assert!(kernel.state().links.contains_key(&dummy.index()));
    Ok(())
}

#[tokio::test]
async fn test_failed_rollback_is_broken() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let dummy = ipdb.create("dummy", "d0").commit().await?;

    dummy.set("mtu", 1400).await?;
    dummy.add_ip("10.1.0.1/24").await?;
    kernel.fail_next(NlMsgType::RTM_NEWADDR, libc::EPERM);
    // The second link change is the rollback.
    kernel.fail_nth(NlMsgType::RTM_SETLINK, 2, libc::EBUSY);

    let err = dummy.commit().await.unwrap_err();
    let Error::Broken { original, rollback } = &err else {
        panic!("expected a broken commit, got {err:?}");
    };
    assert_eq!(original.root_errno(), Some(libc::EPERM));
    assert_eq!(rollback.root_errno(), Some(libc::EBUSY));
    // The database reloaded what the kernel really holds.
    assert_eq!(dummy.get("mtu"), Some(Value::Int(1400)));
    Ok(())
}

#[tokio::test]
async fn test_port_that_never_moves() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let port = ipdb.create("dummy", "d1").commit().await?;
    let bridge = ipdb.create("bridge", "br0").commit().await?;

    bridge.add_port(&port).await?;
    kernel.mute_next(NlMsgType::RTM_SETLINK);
    let err = bridge.commit().await.unwrap_err();
    match &err {
        Error::CommitFailed {
            source: Some(source),
            ..
        } => assert!(
            matches!(**source, Error::PortTargetMissed { port: p } if p == port.index()),
            "got {source:?}"
        ),
        other => panic!("expected a failed commit, got {other:?}"),
    }
    assert!(bridge.ports().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_bond_address_is_resent() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    kernel.bond_drops_first_address();

    let bond = ipdb
        .create("bond", "bond1")
        .add_ip("10.5.0.1/24")
        .commit()
        .await?;
    assert_eq!(kernel.state().received(NlMsgType::RTM_NEWADDR), 3);
    assert!(kernel.state().has_address(bond.index(), "10.5.0.1/24"));
    assert!(bond.ipaddr().contains(&("10.5.0.1".parse().unwrap(), 24)));
    Ok(())
}

#[tokio::test]
async fn test_move_to_namespace() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let dummy = ipdb.create("dummy", "d0").commit().await?;
    let index = dummy.index();

    dummy.set("net_ns_fd", 7).await?;
    dummy.commit().await?;

    assert!(!kernel.state().links.contains_key(&index));
    let sent = kernel.state().requests.last().cloned().expect("a request");
    assert_eq!(sent.get_attr("IFLA_NET_NS_FD").and_then(|v| v.as_u64()), Some(7));
    assert_eq!(dummy.status(), Status::Removed);
    assert!(ipdb.by_name("d0").is_none());
    Ok(())
}

#[tokio::test]
async fn test_alias_cleared_on_rollback() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let dummy = ipdb.create("dummy", "d0").commit().await?;
    let index = dummy.index();

    dummy.set("ifalias", "uplink").await?;
    dummy.add_ip("10.1.0.1/24").await?;
    kernel.fail_next(NlMsgType::RTM_NEWADDR, libc::EPERM);
    assert!(dummy.commit().await.is_err());

    assert!(kernel.state().links[&index].get_attr("IFLA_IFALIAS").is_none());
    assert_eq!(dummy.get("ifalias"), None);
    Ok(())
}

#[tokio::test]
async fn test_flicker_index_taken_by_new_link() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config().keep_flicker(true)).await?;
    let index = kernel.add_link("d8", "dummy");
    assert!(eventually(|| ipdb.by_name("d8").is_some()).await);
    let old = ipdb.by_name("d8").expect("d8");

    kernel.remove_link(index);
    assert!(eventually(|| old.status() == Status::Flicker).await);

    kernel.add_link_at(index, "d9", "dummy");
    assert!(eventually(|| ipdb.by_name("d9").is_some()).await);
    kernel.add_address(index, "10.9.0.1/24");

    let new = ipdb.by_name("d9").expect("d9");
    let seen = eventually(|| new.ipaddr().contains(&("10.9.0.1".parse().unwrap(), 24))).await;
    assert!(seen, "address on the reused index should reach the new link");
    assert_eq!(ipdb.by_index(index).and_then(|i| i.ifname()).as_deref(), Some("d9"));
    assert_eq!(old.status(), Status::Flicker);
    assert!(old.ipaddr().is_empty());
    Ok(())
}
