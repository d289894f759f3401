pub mod config;
pub mod directory;
pub mod error;
pub mod groups;
pub mod identity;
pub mod ids;
pub mod keystore;
pub mod media_conn;
pub mod media_retry;
pub mod message;
pub mod node;
pub mod participants;
pub mod receipts;
pub mod relay;
pub mod sender_keys;
pub mod session;
pub mod signal;
pub mod time;
pub mod transform;
pub mod transport;

use config::CoreConfig;
use directory::DeviceDirectory;
use error::CoreError;
use groups::GroupMetadataProvider;
use identity::LocalIdentity;
use ids::{Device, Jid, MessageKey};
use keystore::{KeyStore, KeyTransactions};
use log::debug;
use media_conn::{MediaConnection, MediaConnectionCache};
use media_retry::{MediaRetryCoordinator, ResolvedMedia};
use message::{Message, PeerDataOperationRequest, ProtocolMessage};
use node::Node;
use participants::ParticipantNodeBuilder;
use receipts::{ReceiptDispatcher, ReceiptKind};
use relay::{MessageRelay, RelayOptions, RelayOutcome};
use session::SessionManager;
use signal::SignalRepository;
use std::sync::Arc;
use std::time::Duration;
use time::unix_seconds;
use transform::OutboundTransform;
use transport::Transport;

/// Everything the engine talks to outside itself.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub signal: Arc<dyn SignalRepository>,
    pub keys: Arc<dyn KeyStore>,
    pub groups: Arc<dyn GroupMetadataProvider>,
    pub transform: Arc<dyn OutboundTransform>,
}

#[derive(Clone)]
pub struct Core {
    config: CoreConfig,
    identity: LocalIdentity,
    transport: Arc<dyn Transport>,
    directory: DeviceDirectory,
    sessions: SessionManager,
    relay: MessageRelay,
    receipts: ReceiptDispatcher,
    media_conn: MediaConnectionCache,
    media_retry: MediaRetryCoordinator,
}

impl Core {
    pub fn init(
        config: CoreConfig,
        identity: LocalIdentity,
        collaborators: Collaborators,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let Collaborators {
            transport,
            signal,
            keys,
            groups,
            transform,
        } = collaborators;
        let server = config.server_domain.clone();
        let directory = DeviceDirectory::new(
            transport.clone(),
            server.clone(),
            identity.jid.clone(),
            Duration::from_secs(config.device_cache_ttl_secs),
        );
        let sessions = SessionManager::new(transport.clone(), signal.clone(), server.clone());
        let builder = ParticipantNodeBuilder::new(signal.clone(), transform, config.best_effort());
        let relay = MessageRelay::new(
            identity.clone(),
            config.clone(),
            transport.clone(),
            signal,
            directory.clone(),
            sessions.clone(),
            builder,
            groups,
            KeyTransactions::new(keys),
        );
        Ok(Self {
            receipts: ReceiptDispatcher::new(transport.clone(), config.send_read_receipts),
            media_conn: MediaConnectionCache::new(transport.clone(), server),
            media_retry: MediaRetryCoordinator::new(
                transport.clone(),
                config.media_download_host.clone(),
            ),
            config,
            identity,
            transport,
            directory,
            sessions,
            relay,
        })
    }

    pub fn local_identity(&self) -> LocalIdentity {
        self.identity.clone()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub async fn relay(
        &self,
        destination: &str,
        message: Message,
        options: RelayOptions,
    ) -> Result<RelayOutcome, CoreError> {
        let destination = Jid::parse(destination)?;
        self.relay.relay(&destination, message, options).await
    }

    pub async fn send_receipt(
        &self,
        jid: &Jid,
        participant: Option<&Jid>,
        message_ids: &[String],
        kind: ReceiptKind,
    ) -> Result<(), CoreError> {
        self.receipts
            .send_receipt(jid, participant, message_ids, kind)
            .await
    }

    pub async fn send_receipts(
        &self,
        keys: &[MessageKey],
        kind: ReceiptKind,
    ) -> Result<(), CoreError> {
        self.receipts.send_receipts(keys, kind).await
    }

    pub async fn read_messages(&self, keys: &[MessageKey]) -> Result<(), CoreError> {
        self.receipts.read_messages(keys).await
    }

    /// Returns whether new sessions were created. Devices the server had no
    /// keys for are reported as an error here, unlike inside a relay where
    /// they are only left out.
    pub async fn ensure_sessions(&self, jids: &[Jid], force: bool) -> Result<bool, CoreError> {
        let outcome = self.sessions.ensure(jids, force).await?;
        if let Some(first) = outcome.missing.first() {
            return Err(CoreError::SessionEstablish(format!(
                "no key material for {} devices, first {}",
                outcome.missing.len(),
                first
            )));
        }
        Ok(outcome.created)
    }

    pub async fn resolve_devices(
        &self,
        jids: &[Jid],
        use_cache: bool,
        ignore_zero_devices: bool,
    ) -> Result<Vec<Device>, CoreError> {
        self.directory
            .resolve(jids, use_cache, ignore_zero_devices)
            .await
    }

    pub async fn invalidate_devices(&self, user: &str) {
        self.directory.invalidate(user).await
    }

    pub async fn media_connection(&self, force_refresh: bool) -> Result<MediaConnection, CoreError> {
        self.media_conn.get(force_refresh).await
    }

    pub async fn invalidate_media_connection(&self) {
        self.media_conn.invalidate().await
    }

    pub async fn request_media_retry(
        &self,
        key: &MessageKey,
        media_key: &[u8],
    ) -> Result<ResolvedMedia, CoreError> {
        self.media_retry
            .request_retry(key, media_key, &self.identity.jid)
            .await
    }

    pub fn handle_media_notification(&self, node: &Node) -> Result<bool, CoreError> {
        self.media_retry.handle_notification(node)
    }

    pub async fn get_privacy_tokens(&self, jids: &[Jid]) -> Result<Node, CoreError> {
        let t = unix_seconds().to_string();
        let tokens = jids
            .iter()
            .map(|jid| {
                Node::new("token")
                    .attr("jid", jid.normalized().to_string())
                    .attr("t", t.clone())
                    .attr("type", "trusted_contact")
            })
            .collect();
        let query = Node::new("iq")
            .attr("to", self.config.server_domain.clone())
            .attr("type", "set")
            .attr("xmlns", "privacy")
            .children(vec![Node::new("tokens").children(tokens)]);
        self.transport.query(query).await
    }

    /// Relays a peer-data-operation request to this account's own devices.
    pub async fn send_peer_data_operation(
        &self,
        request: PeerDataOperationRequest,
    ) -> Result<String, CoreError> {
        let message = Message::Protocol(ProtocolMessage::PeerDataOperation { request });
        let mut options = RelayOptions::default();
        options
            .additional_attributes
            .insert("category".to_string(), "peer".to_string());
        options
            .additional_attributes
            .insert("push_priority".to_string(), "high_force".to_string());
        let outcome = self
            .relay
            .relay(&self.identity.normalized(), message, options)
            .await?;
        debug!("sent peer data operation id={}", outcome.message_id);
        Ok(outcome.message_id)
    }
}

#[cfg(test)]
mod tests;
