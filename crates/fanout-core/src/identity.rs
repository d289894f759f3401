use crate::error::CoreError;
use crate::ids::{Jid, Server};
use crate::node::Node;
use serde::{Deserialize, Serialize};

/// The account this engine sends as.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    /// Own address including this device's index.
    pub jid: Jid,
    pub lid: Option<Jid>,
    /// Signed account identity attached when a recipient sees a pre-key
    /// message from us.
    pub signed_device_identity: Vec<u8>,
}

impl LocalIdentity {
    pub fn new(jid: Jid, signed_device_identity: Vec<u8>) -> Result<Self, CoreError> {
        if !jid.is_user() && !jid.is_lid() {
            return Err(CoreError::MalformedIdentity(jid.to_string()));
        }
        Ok(Self {
            jid,
            lid: None,
            signed_device_identity,
        })
    }

    pub fn with_lid(mut self, lid: Jid) -> Self {
        self.lid = Some(lid);
        self
    }

    pub fn user(&self) -> &str {
        &self.jid.user
    }

    pub fn normalized(&self) -> Jid {
        self.jid.normalized()
    }

    /// User part used when addressing own devices in the given domain.
    pub fn user_for(&self, server: Server) -> &str {
        match (server, self.lid.as_ref()) {
            (Server::Lid, Some(lid)) => &lid.user,
            _ => &self.jid.user,
        }
    }

    pub fn device_identity_node(&self) -> Node {
        Node::new("device-identity").bytes(self.signed_device_identity.clone())
    }
}
