use super::{harness, jid, last_sent, participant_jids, Harness, ME};
use crate::error::CoreError;
use crate::groups::{AddressingMode, GroupMetadata};
use crate::ids::Jid;
use crate::keystore::KeyTransactions;
use crate::message::Message;
use crate::relay::RelayOptions;
use crate::sender_keys::SenderKeyMemory;
use crate::signal::EncType;

const GROUP: &str = "120363000000000001@g.us";

fn member(i: usize) -> Jid {
    jid(&format!("155500001{:02}@s.whatsapp.net", i))
}

async fn setup_group(h: &Harness, size: usize) -> Vec<Jid> {
    let members: Vec<Jid> = (1..=size).map(member).collect();
    for m in members.iter() {
        h.transport.register_devices(&m.user, vec![0]).await;
    }
    h.groups
        .insert(GroupMetadata {
            id: jid(GROUP),
            participants: members.clone(),
            addressing_mode: AddressingMode::Pn,
        })
        .await;
    members
}

async fn remember(h: &Harness, devices: &[Jid]) {
    let transactions = KeyTransactions::new(h.keys.clone());
    let mut txn = transactions.begin(GROUP).await;
    let mut memory = SenderKeyMemory::default();
    for device in devices {
        memory.mark(device);
    }
    memory.save(&mut txn, &jid(GROUP)).expect("save");
    txn.commit().await.expect("commit");
}

async fn remembered(h: &Harness) -> SenderKeyMemory {
    let transactions = KeyTransactions::new(h.keys.clone());
    let txn = transactions.begin(GROUP).await;
    SenderKeyMemory::load(&txn, &jid(GROUP)).await.expect("load")
}

#[tokio::test]
async fn sender_key_goes_only_to_devices_without_it() {
    let h = harness();
    let members = setup_group(&h, 5).await;
    remember(&h, &members[..3]).await;

    let outcome = h
        .core
        .relay(GROUP, Message::text("hi all"), RelayOptions::default())
        .await
        .expect("relay");
    let stanza = last_sent(&h.transport).await;
    let mut devices = participant_jids(&stanza);
    devices.sort();
    assert_eq!(
        devices,
        vec![members[3].to_string(), members[4].to_string()]
    );
    assert_eq!(outcome.device_count, 2);
    let enc = stanza.child("enc").expect("group enc");
    assert_eq!(enc.get_attr("type"), Some(EncType::SenderKey.as_str()));
    assert_eq!(stanza.get_attr("to"), Some(GROUP));
    assert!(stanza.child("device-identity").is_some());
    assert!(stanza.child("bot").is_none());

    let memory = remembered(&h).await;
    assert_eq!(memory.len(), 5);
    assert!(members.iter().all(|m| memory.has(m)));
}

#[tokio::test]
async fn later_relays_skip_distribution() {
    let h = harness();
    setup_group(&h, 3).await;
    h.core
        .relay(GROUP, Message::text("one"), RelayOptions::default())
        .await
        .expect("relay");
    let outcome = h
        .core
        .relay(GROUP, Message::text("two"), RelayOptions::default())
        .await
        .expect("relay");
    assert_eq!(outcome.device_count, 0);
    let stanza = last_sent(&h.transport).await;
    assert!(stanza.child("participants").is_none());
    assert!(stanza.child("enc").is_some());
    assert!(stanza.child("device-identity").is_none());
}

#[tokio::test]
async fn failed_send_does_not_persist_sender_key_memory() {
    let h = harness();
    setup_group(&h, 3).await;
    h.transport.fail_sends(true);
    let err = h
        .core
        .relay(GROUP, Message::text("lost"), RelayOptions::default())
        .await
        .expect_err("send fails");
    assert!(matches!(err, CoreError::Transport(_)));
    assert!(remembered(&h).await.is_empty());

    h.transport.fail_sends(false);
    let outcome = h
        .core
        .relay(GROUP, Message::text("retry"), RelayOptions::default())
        .await
        .expect("relay");
    assert_eq!(outcome.device_count, 3);
}

#[tokio::test]
async fn participant_override_forces_redistribution() {
    let h = harness();
    let members = setup_group(&h, 3).await;
    remember(&h, &members).await;

    let options = RelayOptions {
        participant: Some(members[0].clone()),
        ..RelayOptions::default()
    };
    h.core
        .relay(GROUP, Message::text("resend"), options)
        .await
        .expect("relay");
    let stanza = last_sent(&h.transport).await;
    assert_eq!(participant_jids(&stanza), vec![members[0].to_string()]);
    assert_eq!(stanza.get_attr("to"), Some(GROUP));
    assert_eq!(stanza.get_attr("participant"), Some(members[0].to_string().as_str()));
    assert!(stanza.get_attr("device_fanout").is_none());
}

#[tokio::test]
async fn cached_group_metadata_is_preferred() {
    let h = harness();
    let members = setup_group(&h, 2).await;
    h.groups
        .insert_cached(GroupMetadata {
            id: jid(GROUP),
            participants: members.clone(),
            addressing_mode: AddressingMode::Pn,
        })
        .await;

    h.core
        .relay(GROUP, Message::text("cached"), RelayOptions::default())
        .await
        .expect("relay");
    assert_eq!(h.groups.fetch_count().await, 0);

    let options = RelayOptions {
        use_cached_group_metadata: false,
        ..RelayOptions::default()
    };
    h.core
        .relay(GROUP, Message::text("fetched"), options)
        .await
        .expect("relay");
    assert_eq!(h.groups.fetch_count().await, 1);
}

#[tokio::test]
async fn unknown_group_fails_before_sending() {
    let h = harness();
    let err = h
        .core
        .relay(GROUP, Message::text("x"), RelayOptions::default())
        .await
        .expect_err("no metadata");
    assert!(matches!(err, CoreError::Directory(_)));
    assert!(h.transport.sent().await.is_empty());
}

#[tokio::test]
async fn lid_addressed_group_uses_lid_devices() {
    let h = harness();
    let members = vec![jid("700001@lid"), jid("700002@lid")];
    for m in members.iter() {
        h.transport.register_devices(&m.user, vec![0]).await;
    }
    h.groups
        .insert(GroupMetadata {
            id: jid(GROUP),
            participants: members,
            addressing_mode: AddressingMode::Lid,
        })
        .await;
    h.core
        .relay(GROUP, Message::text("lid group"), RelayOptions::default())
        .await
        .expect("relay");
    let stanza = last_sent(&h.transport).await;
    let mut devices = participant_jids(&stanza);
    devices.sort();
    assert_eq!(devices, vec!["700001@lid".to_string(), "700002@lid".to_string()]);
}

#[tokio::test]
async fn status_broadcast_always_distributes() {
    let h = harness();
    let recipients: Vec<Jid> = (1..=2).map(member).collect();
    for r in recipients.iter() {
        h.transport.register_devices(&r.user, vec![0]).await;
    }
    let options = || RelayOptions {
        status_recipients: recipients.clone(),
        ..RelayOptions::default()
    };
    let buttons = Message::Buttons {
        text: "story".to_string(),
        buttons: vec!["ok".to_string()],
    };
    for _ in 0..2 {
        let outcome = h
            .core
            .relay("status@broadcast", buttons.clone(), options())
            .await
            .expect("relay");
        assert_eq!(outcome.device_count, 2);
    }
    let stanza = last_sent(&h.transport).await;
    assert_eq!(stanza.get_attr("to"), Some("status@broadcast"));
    assert!(stanza.child("biz").is_none());
    assert!(stanza.child("bot").is_none());
}

#[tokio::test]
async fn direct_relay_does_not_hide_primary_device_from_group() {
    let h = harness();
    let bob = jid("15550000002@s.whatsapp.net");
    h.transport.register_devices(ME, vec![0]).await;
    h.transport.register_devices(&bob.user, vec![0, 5]).await;
    h.groups
        .insert(GroupMetadata {
            id: jid(GROUP),
            participants: vec![bob.clone()],
            addressing_mode: AddressingMode::Pn,
        })
        .await;

    h.core
        .relay(&bob.to_string(), Message::text("direct"), RelayOptions::default())
        .await
        .expect("direct relay");
    let outcome = h
        .core
        .relay(GROUP, Message::text("group"), RelayOptions::default())
        .await
        .expect("group relay");

    let devices = participant_jids(&last_sent(&h.transport).await);
    assert!(devices.contains(&"15550000002@s.whatsapp.net".to_string()));
    assert!(devices.contains(&"15550000002:5@s.whatsapp.net".to_string()));
    assert_eq!(outcome.device_count, 2);
    assert_eq!(h.transport.query_count("usync").await, 1);
}

#[tokio::test]
async fn overlapping_relays_fetch_each_device_once() {
    let h = harness();
    let alice = jid("15550000003@s.whatsapp.net");
    h.transport.register_devices(ME, vec![0]).await;
    h.transport.register_devices(&alice.user, vec![0, 1]).await;
    h.groups
        .insert(GroupMetadata {
            id: jid(GROUP),
            participants: vec![alice.clone()],
            addressing_mode: AddressingMode::Pn,
        })
        .await;

    let alice_id = alice.to_string();
    let (direct, group) = tokio::join!(
        h.core
            .relay(&alice_id, Message::text("direct"), RelayOptions::default()),
        h.core
            .relay(GROUP, Message::text("group"), RelayOptions::default())
    );
    direct.expect("direct relay");
    group.expect("group relay");

    let mut fetched: Vec<String> = h
        .transport
        .queries()
        .await
        .iter()
        .filter(|q| q.get_attr("xmlns") == Some("encrypt"))
        .filter_map(|q| q.child("key"))
        .flat_map(|key| {
            key.children_by_tag("user")
                .filter_map(|u| u.get_attr("jid").map(str::to_string))
                .collect::<Vec<_>>()
        })
        .collect();
    fetched.sort();
    assert_eq!(
        fetched,
        vec![
            "15550000003:1@s.whatsapp.net".to_string(),
            "15550000003@s.whatsapp.net".to_string(),
        ]
    );
}
