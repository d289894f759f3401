use super::{harness, harness_with, jid};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::ids::MessageKey;
use crate::receipts::{group_keys, ReceiptKind};

fn key(remote: &str, id: &str, participant: Option<&str>, from_me: bool) -> MessageKey {
    MessageKey {
        remote: jid(remote),
        id: id.to_string(),
        from_me,
        participant: participant.map(jid),
    }
}

const ALICE: &str = "15550000003@s.whatsapp.net";
const GROUP: &str = "120363000000000002@g.us";

#[test]
fn grouping_keeps_first_seen_order_and_drops_own_messages() {
    let keys = vec![
        key(ALICE, "A1", None, false),
        key(GROUP, "G1", Some(ALICE), false),
        key(ALICE, "A2", None, false),
        key(ALICE, "MINE", None, true),
        key(GROUP, "G2", Some("15550000004@s.whatsapp.net"), false),
        key(GROUP, "G3", Some(ALICE), false),
    ];
    let groups = group_keys(&keys);
    assert_eq!(groups.len(), 3);
    assert_eq!(groups[0].message_ids, vec!["A1", "A2"]);
    assert_eq!(groups[1].message_ids, vec!["G1", "G3"]);
    assert_eq!(groups[1].participant, Some(jid(ALICE)));
    assert_eq!(groups[2].message_ids, vec!["G2"]);
}

#[tokio::test]
async fn one_receipt_per_chat_lists_remaining_ids() {
    let h = harness();
    let keys = vec![
        key(ALICE, "A1", None, false),
        key(ALICE, "A2", None, false),
        key(ALICE, "A3", None, false),
    ];
    h.core
        .send_receipts(&keys, ReceiptKind::Delivery)
        .await
        .expect("receipts");
    let sent = h.transport.sent().await;
    assert_eq!(sent.len(), 1);
    let receipt = &sent[0];
    assert_eq!(receipt.tag, "receipt");
    assert_eq!(receipt.get_attr("id"), Some("A1"));
    assert_eq!(receipt.get_attr("to"), Some(ALICE));
    assert!(receipt.get_attr("type").is_none());
    assert!(receipt.get_attr("t").is_none());
    let items: Vec<&str> = receipt
        .child("list")
        .expect("list")
        .children_by_tag("item")
        .filter_map(|i| i.get_attr("id"))
        .collect();
    assert_eq!(items, vec!["A2", "A3"]);
}

#[tokio::test]
async fn empty_receipt_is_rejected() {
    let h = harness();
    let err = h
        .core
        .send_receipts(&[], ReceiptKind::Read)
        .await
        .expect_err("empty");
    assert!(matches!(err, CoreError::InvalidReceipt));
    let err = h
        .core
        .send_receipt(&jid(ALICE), None, &[], ReceiptKind::Read)
        .await
        .expect_err("empty");
    assert!(matches!(err, CoreError::InvalidReceipt));
    assert!(h.transport.sent().await.is_empty());
}

#[tokio::test]
async fn read_receipts_carry_timestamp_and_participant() {
    let h = harness();
    h.core
        .read_messages(&[key(GROUP, "G1", Some(ALICE), false)])
        .await
        .expect("read");
    let receipt = h.transport.sent().await.remove(0);
    assert_eq!(receipt.get_attr("type"), Some("read"));
    assert_eq!(receipt.get_attr("to"), Some(GROUP));
    assert_eq!(receipt.get_attr("participant"), Some(ALICE));
    assert!(receipt.get_attr("t").is_some());
    assert!(receipt.child("list").is_none());
}

#[tokio::test]
async fn private_read_receipts_become_read_self() {
    let config = CoreConfig {
        send_read_receipts: false,
        ..CoreConfig::default()
    };
    let h = harness_with(config);
    h.core
        .read_messages(&[key(ALICE, "A1", None, false)])
        .await
        .expect("read");
    let receipt = h.transport.sent().await.remove(0);
    assert_eq!(receipt.get_attr("type"), Some("read-self"));
}

#[tokio::test]
async fn sender_receipt_in_user_chat_swaps_addressing() {
    let h = harness();
    let device = jid("15550000003:4@s.whatsapp.net");
    h.core
        .send_receipt(
            &jid(ALICE),
            Some(&device),
            &["S1".to_string()],
            ReceiptKind::Sender,
        )
        .await
        .expect("receipt");
    let receipt = h.transport.sent().await.remove(0);
    assert_eq!(receipt.get_attr("recipient"), Some(ALICE));
    assert_eq!(receipt.get_attr("to"), Some("15550000003:4@s.whatsapp.net"));
    assert_eq!(receipt.get_attr("type"), Some("sender"));
    assert!(receipt.get_attr("participant").is_none());
}

#[tokio::test]
async fn newsletter_receipts_are_read_self() {
    let h = harness();
    h.core
        .send_receipt(
            &jid("120363999999999999@newsletter"),
            None,
            &["N1".to_string()],
            ReceiptKind::Played,
        )
        .await
        .expect("receipt");
    let receipt = h.transport.sent().await.remove(0);
    assert_eq!(receipt.get_attr("type"), Some("read-self"));
}
