use crate::error::CoreError;
use crate::ids::Jid;
use crate::keystore::{Transaction, SENDER_KEY_MEMORY};
use crate::message::Message;
use crate::node::Attrs;
use crate::participants::{DeviceFailure, ParticipantNodeBuilder, ParticipantNodes};
use crate::session::SessionManager;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Which device addresses already hold this account's current sender key
/// for one group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderKeyMemory {
    devices: BTreeMap<String, bool>,
}

impl SenderKeyMemory {
    pub async fn load(txn: &Transaction, group: &Jid) -> Result<Self, CoreError> {
        let id = group.to_string();
        let found = txn.get(SENDER_KEY_MEMORY, &[id.clone()]).await?;
        match found.get(&id) {
            Some(bytes) => serde_json::from_slice(bytes).map_err(|_| CoreError::Storage),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, txn: &mut Transaction, group: &Jid) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(self).map_err(|_| CoreError::Storage)?;
        txn.set(SENDER_KEY_MEMORY, &group.to_string(), Some(bytes));
        Ok(())
    }

    pub fn has(&self, device: &Jid) -> bool {
        self.devices.get(&device.to_string()).copied().unwrap_or(false)
    }

    pub fn mark(&mut self, device: &Jid) {
        self.devices.insert(device.to_string(), true);
    }

    pub fn len(&self) -> usize {
        self.devices.values().filter(|v| **v).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct GroupSenderKeyDistributor {
    sessions: SessionManager,
    builder: ParticipantNodeBuilder,
}

impl GroupSenderKeyDistributor {
    pub fn new(sessions: SessionManager, builder: ParticipantNodeBuilder) -> Self {
        Self { sessions, builder }
    }

    /// Builds distribution nodes for every target that does not yet hold the
    /// sender key (all targets when `force` is set) and records them as
    /// holders inside `txn`. Status broadcasts always distribute and keep no
    /// memory.
    pub async fn ensure_distributed(
        &self,
        txn: &mut Transaction,
        group: &Jid,
        targets: &[Jid],
        force: bool,
        distribution_payload: &[u8],
        extra_attrs: &Attrs,
    ) -> Result<ParticipantNodes, CoreError> {
        let remember = !group.is_status_broadcast();
        let mut memory = if remember {
            SenderKeyMemory::load(txn, group).await?
        } else {
            SenderKeyMemory::default()
        };
        let mut seen = HashSet::new();
        let needing: Vec<Jid> = targets
            .iter()
            .filter(|jid| seen.insert((*jid).clone()))
            .filter(|jid| force || !memory.has(jid))
            .cloned()
            .collect();
        if needing.is_empty() {
            return Ok(ParticipantNodes::default());
        }

        debug!("sending new sender key group={} devices={}", group, needing.len());
        let outcome = self.sessions.ensure(&needing, false).await?;
        let reachable: Vec<Jid> = needing
            .into_iter()
            .filter(|jid| !outcome.missing.contains(jid))
            .collect();
        let message = Message::SenderKeyDistribution {
            group: group.clone(),
            payload: distribution_payload.to_vec(),
        };
        let mut built = self.builder.build(&reachable, message, extra_attrs).await?;
        built
            .failures
            .extend(outcome.missing.into_iter().map(|device| DeviceFailure {
                device,
                reason: "no key material".to_string(),
            }));
        if remember {
            for jid in reachable.iter() {
                if !built.failures.iter().any(|f| &f.device == jid) {
                    memory.mark(jid);
                }
            }
            memory.save(txn, group)?;
        }
        Ok(built)
    }
}
