use super::{harness, init_logging, jid, me, ME};
use crate::directory::DeviceDirectory;
use crate::error::CoreError;
use crate::ids::Device;
use crate::transport::MockTransport;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn sessions_are_fetched_once() {
    let h = harness();
    let devices = vec![
        jid("15550000002@s.whatsapp.net"),
        jid("15550000002:3@s.whatsapp.net"),
    ];
    assert!(h.core.ensure_sessions(&devices, false).await.expect("first"));
    assert!(!h.core.ensure_sessions(&devices, false).await.expect("second"));
    assert_eq!(h.transport.query_count("encrypt").await, 1);
    for device in devices.iter() {
        assert!(h.signal.has_session(device).await);
    }

    assert!(h.core.ensure_sessions(&devices, true).await.expect("forced"));
    assert_eq!(h.transport.query_count("encrypt").await, 2);
}

#[tokio::test]
async fn key_fetch_failure_is_session_error() {
    let h = harness();
    h.transport.fail_queries("encrypt").await;
    let err = h
        .core
        .ensure_sessions(&[jid("15550000002@s.whatsapp.net")], false)
        .await
        .expect_err("fails");
    assert!(matches!(err, CoreError::SessionEstablish(_)));
}

#[tokio::test]
async fn resolve_drops_own_device_and_zero_devices_on_request() {
    let h = harness();
    h.transport.register_devices(ME, vec![0, 4]).await;
    h.transport.register_devices("15550000002", vec![0, 1, 2]).await;
    let users = [me(), jid("15550000002@s.whatsapp.net")];

    let mut all = h
        .core
        .resolve_devices(&users, false, false)
        .await
        .expect("resolve");
    all.sort();
    assert_eq!(
        all,
        vec![
            Device::new("15550000001", 4),
            Device::new("15550000002", 0),
            Device::new("15550000002", 1),
            Device::new("15550000002", 2),
        ]
    );

    let without_zero = h
        .core
        .resolve_devices(&users, true, true)
        .await
        .expect("cached");
    assert!(without_zero.iter().all(|d| d.device != 0));
    assert_eq!(without_zero.len(), 3);
    assert_eq!(h.transport.query_count("usync").await, 1);
}

#[tokio::test]
async fn cache_filled_without_zero_devices_still_returns_them() {
    let h = harness();
    h.transport.register_devices("15550000002", vec![0, 5]).await;
    let users = [jid("15550000002@s.whatsapp.net")];

    let filtered = h
        .core
        .resolve_devices(&users, true, true)
        .await
        .expect("filtered");
    assert_eq!(filtered, vec![Device::new("15550000002", 5)]);

    let mut cached = h
        .core
        .resolve_devices(&users, true, false)
        .await
        .expect("cached");
    cached.sort();
    assert_eq!(
        cached,
        vec![Device::new("15550000002", 0), Device::new("15550000002", 5)]
    );
    assert_eq!(h.transport.query_count("usync").await, 1);
}

#[tokio::test]
async fn withheld_keys_create_no_session() {
    let h = harness();
    let keyless = jid("15550000002@s.whatsapp.net");
    h.transport.withhold_keys(&keyless).await;
    let err = h
        .core
        .ensure_sessions(&[keyless.clone()], false)
        .await
        .expect_err("no material");
    assert!(matches!(err, CoreError::SessionEstablish(_)));
    assert!(!h.signal.has_session(&keyless).await);
}

#[tokio::test]
async fn duplicate_users_are_queried_once() {
    let h = harness();
    h.transport.register_devices("15550000002", vec![0]).await;
    let devices = h
        .core
        .resolve_devices(
            &[
                jid("15550000002@s.whatsapp.net"),
                jid("15550000002:7@s.whatsapp.net"),
                jid("15550000002@c.us"),
            ],
            true,
            false,
        )
        .await
        .expect("resolve");
    assert_eq!(devices, vec![Device::new("15550000002", 0)]);
    let usync = h
        .transport
        .queries()
        .await
        .into_iter()
        .find(|q| q.get_attr("xmlns") == Some("usync"))
        .expect("usync");
    let listed = usync
        .child("usync")
        .and_then(|u| u.child("list"))
        .map(|l| l.child_nodes().len());
    assert_eq!(listed, Some(1));
}

#[tokio::test]
async fn cache_entries_expire_and_can_be_invalidated() {
    init_logging();
    let transport = Arc::new(MockTransport::new());
    transport.register_devices("15550000002", vec![0, 1]).await;
    let directory = DeviceDirectory::new(
        transport.clone(),
        "s.whatsapp.net".to_string(),
        me(),
        Duration::from_millis(20),
    );
    let users = [jid("15550000002@s.whatsapp.net")];

    directory.resolve(&users, true, false).await.expect("first");
    directory.resolve(&users, true, false).await.expect("cached");
    assert_eq!(transport.query_count("usync").await, 1);

    tokio::time::sleep(Duration::from_millis(40)).await;
    directory.resolve(&users, true, false).await.expect("expired");
    assert_eq!(transport.query_count("usync").await, 2);

    directory.invalidate("15550000002").await;
    directory.resolve(&users, true, false).await.expect("invalidated");
    assert_eq!(transport.query_count("usync").await, 3);

    transport.register_devices("15550000002", vec![0, 1, 2]).await;
    directory.clear().await;
    let devices = directory.resolve(&users, true, false).await.expect("cleared");
    assert_eq!(devices.len(), 3);
}

#[tokio::test]
async fn directory_query_failure_is_directory_error() {
    let h = harness();
    h.transport.fail_queries("usync").await;
    let err = h
        .core
        .resolve_devices(&[jid("15550000002@s.whatsapp.net")], true, false)
        .await
        .expect_err("fails");
    assert!(matches!(err, CoreError::Directory(_)));
}

#[tokio::test]
async fn privacy_tokens_query_lists_normalized_identities() {
    let h = harness();
    let response = h
        .core
        .get_privacy_tokens(&[
            jid("15550000002:4@s.whatsapp.net"),
            jid("15550000003@c.us"),
        ])
        .await
        .expect("tokens");
    assert_eq!(response.get_attr("type"), Some("result"));
    let query = h.transport.queries().await.remove(0);
    assert_eq!(query.get_attr("xmlns"), Some("privacy"));
    assert_eq!(query.get_attr("type"), Some("set"));
    let tokens: Vec<&crate::node::Node> = query
        .child("tokens")
        .expect("tokens")
        .children_by_tag("token")
        .collect();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0].get_attr("jid"), Some("15550000002@s.whatsapp.net"));
    assert_eq!(tokens[1].get_attr("jid"), Some("15550000003@s.whatsapp.net"));
    assert_eq!(tokens[0].get_attr("type"), Some("trusted_contact"));
    assert_eq!(tokens[0].get_attr("t"), tokens[1].get_attr("t"));
}
