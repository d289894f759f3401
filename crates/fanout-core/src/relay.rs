use crate::config::CoreConfig;
use crate::directory::DeviceDirectory;
use crate::error::CoreError;
use crate::groups::{GroupMetadata, GroupMetadataProvider};
use crate::identity::LocalIdentity;
use crate::ids::{generate_message_id, Device, Jid, Server};
use crate::keystore::KeyTransactions;
use crate::message::{encode_newsletter, Message, ProtocolMessage};
use crate::node::{Attrs, Node};
use crate::participants::{DeviceFailure, ParticipantNodeBuilder, ParticipantNodes};
use crate::sender_keys::GroupSenderKeyDistributor;
use crate::session::SessionManager;
use crate::signal::{EncType, SignalRepository};
use crate::transport::Transport;
use log::{debug, trace};
use std::collections::HashSet;
use std::sync::Arc;

/// Routing class of a destination; exactly one applies per relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Newsletter,
    Group,
    Status,
    Direct,
}

pub fn classify(destination: &Jid) -> Result<Route, CoreError> {
    match destination.server {
        Server::Newsletter => Ok(Route::Newsletter),
        Server::Group => Ok(Route::Group),
        Server::Broadcast if destination.is_status_broadcast() => Ok(Route::Status),
        Server::Broadcast => Err(CoreError::MalformedIdentity(destination.to_string())),
        Server::User | Server::LegacyUser | Server::Lid => Ok(Route::Direct),
    }
}

#[derive(Clone, Debug)]
pub struct RelayOptions {
    pub message_id: Option<String>,
    /// Deliver to exactly this device instead of fanning out.
    pub participant: Option<Jid>,
    pub additional_attributes: Attrs,
    pub additional_nodes: Vec<Node>,
    /// Set when `additional_nodes` already carry the bot/business markers;
    /// they are then sent in place of the generated ones.
    pub additional_nodes_replace_markers: bool,
    pub use_device_cache: bool,
    pub use_cached_group_metadata: bool,
    pub status_recipients: Vec<Jid>,
    /// `None` uses `CoreConfig::attach_bot_marker`.
    pub attach_bot_marker: Option<bool>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            message_id: None,
            participant: None,
            additional_attributes: Attrs::new(),
            additional_nodes: Vec::new(),
            additional_nodes_replace_markers: false,
            use_device_cache: true,
            use_cached_group_metadata: true,
            status_recipients: Vec::new(),
            attach_bot_marker: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayOutcome {
    pub message_id: String,
    pub device_count: usize,
    /// Devices left out; only non-empty in best-effort mode or when a key
    /// fetch returned nothing for a device.
    pub failures: Vec<DeviceFailure>,
}

#[derive(Clone)]
pub struct MessageRelay {
    identity: LocalIdentity,
    config: CoreConfig,
    transport: Arc<dyn Transport>,
    signal: Arc<dyn SignalRepository>,
    directory: DeviceDirectory,
    sessions: SessionManager,
    builder: ParticipantNodeBuilder,
    distributor: GroupSenderKeyDistributor,
    groups: Arc<dyn GroupMetadataProvider>,
    transactions: KeyTransactions,
}

/// What a routing branch contributes to the stanza.
#[derive(Default)]
struct BranchOutput {
    content: Vec<Node>,
    participants: ParticipantNodes,
    sessions_created: bool,
}

impl MessageRelay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: LocalIdentity,
        config: CoreConfig,
        transport: Arc<dyn Transport>,
        signal: Arc<dyn SignalRepository>,
        directory: DeviceDirectory,
        sessions: SessionManager,
        builder: ParticipantNodeBuilder,
        groups: Arc<dyn GroupMetadataProvider>,
        transactions: KeyTransactions,
    ) -> Self {
        let distributor = GroupSenderKeyDistributor::new(sessions.clone(), builder.clone());
        Self {
            identity,
            config,
            transport,
            signal,
            directory,
            sessions,
            builder,
            distributor,
            groups,
            transactions,
        }
    }

    pub async fn relay(
        &self,
        destination: &Jid,
        message: Message,
        options: RelayOptions,
    ) -> Result<RelayOutcome, CoreError> {
        let route = classify(destination)?;
        let destination_jid = match route {
            Route::Status => Jid::status_broadcast(),
            _ => destination.normalized(),
        };
        let mut message_id = options
            .message_id
            .clone()
            .unwrap_or_else(|| generate_message_id(Some(&self.identity.jid)));
        let is_peer = options.additional_attributes.get("category").map(String::as_str)
            == Some("peer");
        let mut attributes = options.additional_attributes.clone();
        if options.participant.is_some() && !matches!(route, Route::Group | Route::Status) {
            attributes.insert("device_fanout".to_string(), "false".to_string());
        }
        let extra_attrs = content_attrs(&message);
        let stanza_type = message.stanza_type();
        let button_type = message.button_type().map(str::to_string);
        let override_devices: Vec<Device> = options
            .participant
            .iter()
            .map(|p| Device::new(p.user.clone(), p.device))
            .collect();

        let mut txn = self.transactions.begin(&destination_jid.to_string()).await;

        let branch = match route {
            Route::Newsletter => {
                let (effective, rewritten_id) = newsletter_payload(&message);
                if let Some(id) = rewritten_id {
                    message_id = id;
                }
                let bytes = match effective {
                    Some(msg) => {
                        let patched = self.builder.transform().transform(msg, &[]).await;
                        encode_newsletter(Some(&patched))?
                    }
                    None => encode_newsletter(None)?,
                };
                BranchOutput {
                    content: vec![Node::new("plaintext").attrs(&extra_attrs).bytes(bytes)],
                    ..BranchOutput::default()
                }
            }
            Route::Group | Route::Status => {
                let metadata = match route {
                    Route::Group => Some(self.group_metadata(&destination_jid, &options).await?),
                    _ => None,
                };
                let server = metadata
                    .as_ref()
                    .map(|m| m.addressing_mode.server())
                    .unwrap_or(Server::User);
                let devices = if override_devices.is_empty() {
                    let mut members: Vec<Jid> = metadata
                        .as_ref()
                        .map(|m| m.participants.clone())
                        .unwrap_or_default();
                    if route == Route::Status {
                        members.extend(options.status_recipients.iter().cloned());
                    }
                    self.directory
                        .resolve(&members, options.use_device_cache, false)
                        .await?
                } else {
                    override_devices.clone()
                };
                let device_jids = unique_jids(devices.iter().map(|d| d.jid(server)));

                let patched = self
                    .builder
                    .transform()
                    .transform(message.clone(), &device_jids)
                    .await;
                let bytes = patched.encode()?;
                let group_cipher = self
                    .signal
                    .encrypt_for_group(&destination_jid, &bytes, &self.identity.jid)
                    .await
                    .map_err(|e| CoreError::encrypt(&destination_jid, e))?;
                let participants = self
                    .distributor
                    .ensure_distributed(
                        &mut txn,
                        &destination_jid,
                        &device_jids,
                        options.participant.is_some(),
                        &group_cipher.distribution_payload,
                        &extra_attrs,
                    )
                    .await?;
                let enc = Node::new("enc")
                    .attr("v", "2")
                    .attr("type", EncType::SenderKey.as_str())
                    .attrs(&extra_attrs)
                    .bytes(group_cipher.ciphertext);
                BranchOutput {
                    content: vec![enc],
                    participants,
                    sessions_created: false,
                }
            }
            Route::Direct => {
                self.direct_branch(
                    &destination_jid,
                    &message,
                    &options,
                    override_devices,
                    is_peer,
                    &extra_attrs,
                )
                .await?
            }
        };

        let BranchOutput {
            mut content,
            participants,
            sessions_created,
        } = branch;
        if !participants.nodes.is_empty() {
            if is_peer {
                if let Some(enc) = participants.nodes.first().and_then(|n| n.child("enc")) {
                    content.push(enc.clone());
                }
            } else {
                content.push(Node::new("participants").children(participants.nodes.clone()));
            }
        }

        let mut stanza = Node::new("message")
            .attr("id", message_id.clone())
            .attr("type", stanza_type)
            .attrs(&attributes)
            .children(content);
        match options.participant.as_ref() {
            Some(p) if destination_jid.is_group() => {
                stanza.attrs.insert("to".to_string(), destination_jid.to_string());
                stanza.attrs.insert("participant".to_string(), p.to_string());
            }
            Some(p) if p.same_user(&self.identity.jid) => {
                stanza.attrs.insert("to".to_string(), p.to_string());
                stanza
                    .attrs
                    .insert("recipient".to_string(), destination_jid.to_string());
            }
            Some(p) => {
                stanza.attrs.insert("to".to_string(), p.to_string());
            }
            None => {
                stanza.attrs.insert("to".to_string(), destination_jid.to_string());
            }
        }

        if participants.pre_key_used || sessions_created {
            stanza.push_child(self.identity.device_identity_node());
            debug!("adding device identity to={}", destination_jid);
        }

        let replace_markers =
            options.additional_nodes_replace_markers && !options.additional_nodes.is_empty();
        let mut caller_nodes_sent = false;
        let attach_bot = options
            .attach_bot_marker
            .unwrap_or(self.config.attach_bot_marker);
        if attach_bot && route == Route::Direct && destination_jid.is_user() {
            if replace_markers {
                push_all(&mut stanza, &options.additional_nodes, &mut caller_nodes_sent);
            } else {
                stanza.push_child(Node::new("bot").attr("biz_bot", "1"));
            }
        }
        if let Some(button_type) = button_type {
            if !matches!(route, Route::Newsletter | Route::Status) {
                if replace_markers {
                    push_all(&mut stanza, &options.additional_nodes, &mut caller_nodes_sent);
                } else {
                    stanza.push_child(Node::new("biz").attr("type", button_type));
                }
                debug!("adding business node to={}", destination_jid);
            }
        }
        if !caller_nodes_sent {
            for node in options.additional_nodes.iter() {
                stanza.push_child(node.clone());
            }
        }

        debug!(
            "sending message to {} devices id={}",
            participants.nodes.len(),
            message_id
        );
        self.transport.send(stanza).await?;
        txn.commit().await?;

        Ok(RelayOutcome {
            message_id,
            device_count: participants.nodes.len(),
            failures: participants.failures,
        })
    }

    async fn group_metadata(
        &self,
        group: &Jid,
        options: &RelayOptions,
    ) -> Result<GroupMetadata, CoreError> {
        if options.use_cached_group_metadata {
            if let Some(metadata) = self.groups.cached_group_metadata(group).await {
                trace!(
                    "using cached group metadata group={} participants={}",
                    group,
                    metadata.participants.len()
                );
                return Ok(metadata);
            }
        }
        self.groups
            .group_metadata(group)
            .await
            .map_err(|e| CoreError::Directory(format!("group metadata {}: {}", group, e)))
    }

    async fn direct_branch(
        &self,
        destination: &Jid,
        message: &Message,
        options: &RelayOptions,
        override_devices: Vec<Device>,
        is_peer: bool,
        extra_attrs: &Attrs,
    ) -> Result<BranchOutput, CoreError> {
        let me_user = self.identity.user().to_string();
        let server = if destination.is_lid() {
            Server::Lid
        } else {
            Server::User
        };
        let mut devices = override_devices;
        if devices.is_empty() {
            devices.push(Device::new(destination.user.clone(), 0));
            if destination.user != me_user && self.identity.jid.device != 0 {
                devices.push(Device::new(me_user.clone(), 0));
            }
            if !is_peer {
                let resolved = self
                    .directory
                    .resolve(
                        &[self.identity.normalized(), destination.clone()],
                        options.use_device_cache,
                        true,
                    )
                    .await?;
                devices.extend(resolved);
            }
        }

        let mut seen = HashSet::new();
        let mut me_jids = Vec::new();
        let mut other_jids = Vec::new();
        for device in devices.iter() {
            let is_me = device.user == me_user;
            let user = if is_me {
                self.identity.user_for(server).to_string()
            } else {
                device.user.clone()
            };
            let jid = Jid::with_device(user, device.device, server);
            if !seen.insert(jid.clone()) {
                continue;
            }
            if is_me {
                me_jids.push(jid);
            } else {
                other_jids.push(jid);
            }
        }

        let all: Vec<Jid> = me_jids.iter().chain(other_jids.iter()).cloned().collect();
        let outcome = self.sessions.ensure(&all, false).await?;
        me_jids.retain(|j| !outcome.missing.contains(j));
        other_jids.retain(|j| !outcome.missing.contains(j));

        let echo = Message::DeviceSent {
            destination: destination.clone(),
            message: Box::new(message.clone()),
        };
        let (me_nodes, other_nodes) = tokio::join!(
            self.builder.build(&me_jids, echo, extra_attrs),
            self.builder.build(&other_jids, message.clone(), extra_attrs)
        );
        let mut participants = me_nodes?;
        participants.merge(other_nodes?);
        participants
            .failures
            .extend(outcome.missing.into_iter().map(|device| DeviceFailure {
                device,
                reason: "no key material".to_string(),
            }));
        Ok(BranchOutput {
            content: Vec::new(),
            participants,
            sessions_created: outcome.created,
        })
    }
}

fn content_attrs(message: &Message) -> Attrs {
    let mut attrs = Attrs::new();
    if let Some(media_type) = message.media_type() {
        attrs.insert("mediatype".to_string(), media_type.to_string());
    }
    if message.hides_decrypt_failure() {
        attrs.insert("decrypt-fail".to_string(), "hide".to_string());
    }
    if let Some(name) = message.native_flow_name() {
        attrs.insert("native_flow_name".to_string(), name.to_string());
    }
    attrs
}

/// Channel edits and deletes are posted under the id of the message they
/// target; a delete carries an empty body.
fn newsletter_payload(message: &Message) -> (Option<Message>, Option<String>) {
    match message.normalized() {
        Message::Protocol(ProtocolMessage::Edit { key, edited }) => {
            (Some((**edited).clone()), Some(key.id.clone()))
        }
        Message::Protocol(ProtocolMessage::Revoke { key }) => (None, Some(key.id.clone())),
        other => (Some(other.clone()), None),
    }
}

fn unique_jids(jids: impl Iterator<Item = Jid>) -> Vec<Jid> {
    let mut seen = HashSet::new();
    jids.filter(|j| seen.insert(j.clone())).collect()
}

fn push_all(stanza: &mut Node, nodes: &[Node], sent: &mut bool) {
    if *sent {
        return;
    }
    for node in nodes.iter() {
        stanza.push_child(node.clone());
    }
    *sent = true;
}
