use crate::error::CoreError;
use crate::ids::Jid;
use crate::message::Message;
use crate::node::{Attrs, Node};
use crate::signal::{EncType, SignalRepository};
use crate::transform::OutboundTransform;
use futures::future::join_all;
use log::warn;
use std::sync::Arc;

/// A device left out of a best-effort fan-out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceFailure {
    pub device: Jid,
    pub reason: String,
}

#[derive(Clone, Debug, Default)]
pub struct ParticipantNodes {
    pub nodes: Vec<Node>,
    pub pre_key_used: bool,
    pub failures: Vec<DeviceFailure>,
}

impl ParticipantNodes {
    pub fn merge(&mut self, other: ParticipantNodes) {
        self.nodes.extend(other.nodes);
        self.pre_key_used |= other.pre_key_used;
        self.failures.extend(other.failures);
    }
}

#[derive(Clone)]
pub struct ParticipantNodeBuilder {
    signal: Arc<dyn SignalRepository>,
    transform: Arc<dyn OutboundTransform>,
    best_effort: bool,
}

impl ParticipantNodeBuilder {
    pub fn new(
        signal: Arc<dyn SignalRepository>,
        transform: Arc<dyn OutboundTransform>,
        best_effort: bool,
    ) -> Self {
        Self {
            signal,
            transform,
            best_effort,
        }
    }

    pub fn transform(&self) -> Arc<dyn OutboundTransform> {
        self.transform.clone()
    }

    /// Serializes `message` once and encrypts the same bytes for every
    /// device concurrently, one `to` node per device.
    pub async fn build(
        &self,
        devices: &[Jid],
        message: Message,
        extra_attrs: &Attrs,
    ) -> Result<ParticipantNodes, CoreError> {
        if devices.is_empty() {
            return Ok(ParticipantNodes::default());
        }
        let patched = self.transform.transform(message, devices).await;
        let bytes = patched.encode()?;
        let encrypted = join_all(devices.iter().map(|jid| {
            let bytes = &bytes;
            async move { (jid, self.signal.encrypt_for_device(jid, bytes).await) }
        }))
        .await;

        let mut out = ParticipantNodes::default();
        for (jid, result) in encrypted.into_iter() {
            match result {
                Ok(enc) => {
                    if enc.enc_type == EncType::PreKey {
                        out.pre_key_used = true;
                    }
                    let enc_node = Node::new("enc")
                        .attr("v", "2")
                        .attr("type", enc.enc_type.as_str())
                        .attrs(extra_attrs)
                        .bytes(enc.ciphertext);
                    out.nodes.push(
                        Node::new("to")
                            .attr("jid", jid.to_string())
                            .children(vec![enc_node]),
                    );
                }
                Err(e) if self.best_effort => {
                    warn!("skipping device {} after encrypt failure: {}", jid, e);
                    out.failures.push(DeviceFailure {
                        device: jid.clone(),
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(CoreError::encrypt(jid, e)),
            }
        }
        Ok(out)
    }
}
