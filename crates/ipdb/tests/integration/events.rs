//! Notification handling: callbacks, the event stream and changes made
//! outside the database.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ipdb::netlink::NlMsgType;
use ipdb::{Error, Result, Status};
use tokio_stream::StreamExt;

use crate::common::{FakeKernel, config, eventually};

#[tokio::test]
async fn test_external_link_tracked() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;

    let index = kernel.add_link("ext0", "dummy");
    assert!(eventually(|| ipdb.by_name("ext0").is_some()).await);
    let ext = ipdb.by_index(index).expect("by index");
    assert_eq!(ext.kind().as_deref(), Some("dummy"));

    kernel.remove_link(index);
    assert!(eventually(|| ipdb.by_name("ext0").is_none()).await);
    assert_eq!(ext.status(), Status::Removed);
    Ok(())
}

#[tokio::test]
async fn test_callbacks() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let seen = Arc::new(AtomicUsize::new(0));
    let id = ipdb.register_callback({
        let seen = Arc::clone(&seen);
        move |msg| {
            if msg.msg_type() == NlMsgType::RTM_NEWLINK {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    kernel.add_link("ext0", "dummy");
    assert!(eventually(|| seen.load(Ordering::SeqCst) == 1).await);

    assert!(ipdb.unregister_callback(id));
    assert!(!ipdb.unregister_callback(id));
    kernel.add_link("ext1", "dummy");
    assert!(eventually(|| ipdb.by_name("ext1").is_some()).await);
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_event_stream() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;
    let mut events = Box::pin(ipdb.events());

    kernel.add_link("ext0", "dummy");
    let msg = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .expect("event in time")
        .expect("stream open");
    assert_eq!(msg.msg_type(), NlMsgType::RTM_NEWLINK);
    Ok(())
}

#[tokio::test]
async fn test_wait_interface() -> Result<()> {
    let (ipdb, kernel) = FakeKernel::open(config()).await?;

    let waiter = tokio::spawn({
        let ipdb = ipdb.clone();
        async move { ipdb.wait_interface("late0", Duration::from_secs(1)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    kernel.add_link("late0", "dummy");

    let late = waiter.await.expect("join")?;
    assert_eq!(late.ifname().as_deref(), Some("late0"));

    let err = ipdb
        .wait_interface("never0", Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    Ok(())
}

#[tokio::test]
async fn test_json_dump() -> Result<()> {
    let (ipdb, _kernel) = FakeKernel::open(config()).await?;

    let dump = ipdb.to_json();
    let text = dump.to_string();
    assert!(text.contains("\"lo\""), "dump: {text}");
    Ok(())
}
