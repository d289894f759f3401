use crate::ids::Jid;
use crate::message::Message;
use async_trait::async_trait;

/// Rewrites a payload once before it is serialized for a set of targets.
#[async_trait]
pub trait OutboundTransform: Send + Sync {
    async fn transform(&self, message: Message, targets: &[Jid]) -> Message;
}

pub struct PassthroughTransform;

#[async_trait]
impl OutboundTransform for PassthroughTransform {
    async fn transform(&self, message: Message, _targets: &[Jid]) -> Message {
        message
    }
}
