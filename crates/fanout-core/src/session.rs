use crate::error::CoreError;
use crate::ids::Jid;
use crate::keystore::NamedLocks;
use crate::node::Node;
use crate::signal::{KeyBundle, SignalRepository};
use crate::transport::Transport;
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionOutcome {
    /// True when the key fetch returned material and sessions were injected.
    pub created: bool,
    /// Devices the key fetch returned no material for. They stay without a
    /// session and must be left out of the fan-out.
    pub missing: Vec<Jid>,
}

#[derive(Clone)]
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    signal: Arc<dyn SignalRepository>,
    server: String,
    device_locks: NamedLocks,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        signal: Arc<dyn SignalRepository>,
        server: String,
    ) -> Self {
        Self {
            transport,
            signal,
            server,
            device_locks: NamedLocks::new(),
        }
    }

    pub async fn ensure(&self, jids: &[Jid], force: bool) -> Result<SessionOutcome, CoreError> {
        let addresses: Vec<String> = jids.iter().map(|j| self.signal.address_for(j)).collect();
        // held until fetched bundles are injected
        let _guards = self.device_locks.acquire_all(&addresses).await;
        let requiring_fetch: Vec<Jid> = if force {
            jids.to_vec()
        } else {
            let existing = self.signal.session_exists(&addresses).await?;
            jids.iter()
                .zip(addresses.iter())
                .filter(|(_, addr)| !existing.get(*addr).copied().unwrap_or(false))
                .map(|(jid, _)| jid.clone())
                .collect()
        };
        if requiring_fetch.is_empty() {
            return Ok(SessionOutcome::default());
        }

        debug!("fetching sessions for {} devices", requiring_fetch.len());
        let query = Node::new("iq")
            .attr("xmlns", "encrypt")
            .attr("type", "get")
            .attr("to", self.server.clone())
            .children(vec![Node::new("key").children(
                requiring_fetch
                    .iter()
                    .map(|jid| Node::new("user").attr("jid", jid.to_string()))
                    .collect(),
            )]);
        let response = self
            .transport
            .query(query)
            .await
            .map_err(|e| CoreError::SessionEstablish(format!("key fetch: {}", e)))?;
        let bundles = parse_key_bundles(&response)?;
        let returned: HashSet<Jid> = bundles.iter().map(|b| b.jid.clone()).collect();
        let missing: Vec<Jid> = requiring_fetch
            .into_iter()
            .filter(|jid| !returned.contains(jid))
            .collect();
        if !missing.is_empty() {
            warn!("no key material for {} devices", missing.len());
        }
        let created = !bundles.is_empty();
        self.signal
            .inject_key_bundles(bundles)
            .await
            .map_err(|e| CoreError::SessionEstablish(format!("inject: {}", e)))?;
        Ok(SessionOutcome {
            created,
            missing,
        })
    }
}

fn parse_key_bundles(response: &Node) -> Result<Vec<KeyBundle>, CoreError> {
    let Some(list) = response.child("list") else {
        return Ok(Vec::new());
    };
    list.children_by_tag("user")
        .map(|user| {
            let jid = user
                .get_attr("jid")
                .ok_or_else(|| CoreError::SessionEstablish("user without jid".to_string()))
                .and_then(Jid::parse)?;
            let bundle = user
                .child("key-bundle")
                .and_then(|b| b.content_bytes())
                .ok_or_else(|| CoreError::SessionEstablish(format!("no bundle for {}", jid)))?;
            Ok(KeyBundle {
                jid,
                bundle: bundle.to_vec(),
            })
        })
        .collect()
}
