use crate::error::CoreError;
use crate::ids::{Jid, MessageKey};
use crate::node::Node;
use crate::time::unix_seconds;
use crate::transport::Transport;
use log::debug;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiptKind {
    /// Plain delivery ack; sent without a `type` attribute.
    Delivery,
    Read,
    ReadSelf,
    Played,
    Sender,
    Inactive,
}

impl ReceiptKind {
    pub fn as_attr(&self) -> Option<&'static str> {
        match self {
            ReceiptKind::Delivery => None,
            ReceiptKind::Read => Some("read"),
            ReceiptKind::ReadSelf => Some("read-self"),
            ReceiptKind::Played => Some("played"),
            ReceiptKind::Sender => Some("sender"),
            ReceiptKind::Inactive => Some("inactive"),
        }
    }

    pub fn is_read(&self) -> bool {
        matches!(self, ReceiptKind::Read | ReceiptKind::ReadSelf)
    }
}

/// Message ids acknowledged together to one chat and sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceiptGroup {
    pub jid: Jid,
    pub participant: Option<Jid>,
    pub message_ids: Vec<String>,
}

/// Groups keys by chat and participant in first-seen order, dropping keys
/// of messages this account sent.
pub fn group_keys(keys: &[MessageKey]) -> Vec<ReceiptGroup> {
    let mut groups: Vec<ReceiptGroup> = Vec::new();
    for key in keys.iter().filter(|k| !k.from_me) {
        match groups
            .iter_mut()
            .find(|g| g.jid == key.remote && g.participant == key.participant)
        {
            Some(group) => group.message_ids.push(key.id.clone()),
            None => groups.push(ReceiptGroup {
                jid: key.remote.clone(),
                participant: key.participant.clone(),
                message_ids: vec![key.id.clone()],
            }),
        }
    }
    groups
}

#[derive(Clone)]
pub struct ReceiptDispatcher {
    transport: Arc<dyn Transport>,
    send_read_receipts: bool,
}

impl ReceiptDispatcher {
    pub fn new(transport: Arc<dyn Transport>, send_read_receipts: bool) -> Self {
        Self {
            transport,
            send_read_receipts,
        }
    }

    pub async fn send_receipt(
        &self,
        jid: &Jid,
        participant: Option<&Jid>,
        message_ids: &[String],
        kind: ReceiptKind,
    ) -> Result<(), CoreError> {
        let (first, rest) = message_ids.split_first().ok_or(CoreError::InvalidReceipt)?;
        let mut node = Node::new("receipt").attr("id", first.clone());
        if kind.is_read() {
            node = node.attr("t", unix_seconds().to_string());
        }
        match participant {
            Some(participant) if kind == ReceiptKind::Sender && jid.is_user() => {
                node = node
                    .attr("recipient", jid.to_string())
                    .attr("to", participant.to_string());
            }
            _ => {
                node = node.attr("to", jid.to_string());
                if let Some(participant) = participant {
                    node = node.attr("participant", participant.to_string());
                }
            }
        }
        if let Some(kind) = kind.as_attr() {
            let kind = if jid.is_newsletter() { "read-self" } else { kind };
            node = node.attr("type", kind);
        }
        if !rest.is_empty() {
            let items = rest
                .iter()
                .map(|id| Node::new("item").attr("id", id.clone()))
                .collect();
            node = node.children(vec![Node::new("list").children(items)]);
        }
        debug!(
            "sending receipt for messages to={} type={:?} ids={}",
            jid,
            kind.as_attr(),
            message_ids.len()
        );
        self.transport.send(node).await
    }

    /// One receipt per chat/participant pair.
    pub async fn send_receipts(
        &self,
        keys: &[MessageKey],
        kind: ReceiptKind,
    ) -> Result<(), CoreError> {
        if keys.is_empty() {
            return Err(CoreError::InvalidReceipt);
        }
        for group in group_keys(keys) {
            self.send_receipt(
                &group.jid,
                group.participant.as_ref(),
                &group.message_ids,
                kind,
            )
            .await?;
        }
        Ok(())
    }

    pub async fn read_messages(&self, keys: &[MessageKey]) -> Result<(), CoreError> {
        let kind = if self.send_read_receipts {
            ReceiptKind::Read
        } else {
            ReceiptKind::ReadSelf
        };
        self.send_receipts(keys, kind).await
    }
}
