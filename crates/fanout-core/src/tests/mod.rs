pub mod receipts_tests;
pub mod relay_group_tests;
pub mod session_tests;

use crate::config::CoreConfig;
use crate::groups::InMemoryGroupMetadata;
use crate::identity::LocalIdentity;
use crate::ids::{Jid, Server};
use crate::keystore::MemoryKeyStore;
use crate::node::Node;
use crate::signal::InMemorySignalRepository;
use crate::transform::PassthroughTransform;
use crate::transport::MockTransport;
use crate::{Collaborators, Core};
use std::sync::Arc;

pub const ME: &str = "15550000001";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn jid(value: &str) -> Jid {
    Jid::parse(value).expect("jid")
}

pub fn me() -> Jid {
    Jid::new(ME, Server::User)
}

pub struct Harness {
    pub core: Core,
    pub transport: Arc<MockTransport>,
    pub signal: Arc<InMemorySignalRepository>,
    pub keys: Arc<MemoryKeyStore>,
    pub groups: Arc<InMemoryGroupMetadata>,
}

pub fn harness() -> Harness {
    harness_with(CoreConfig::default())
}

pub fn harness_with(config: CoreConfig) -> Harness {
    init_logging();
    let transport = Arc::new(MockTransport::new());
    let signal = Arc::new(InMemorySignalRepository::new());
    let keys = Arc::new(MemoryKeyStore::new());
    let groups = Arc::new(InMemoryGroupMetadata::new());
    let identity = LocalIdentity::new(me(), b"signed-identity".to_vec())
        .expect("identity")
        .with_lid(Jid::new("88000001", Server::Lid));
    let core = Core::init(
        config,
        identity,
        Collaborators {
            transport: transport.clone(),
            signal: signal.clone(),
            keys: keys.clone(),
            groups: groups.clone(),
            transform: Arc::new(PassthroughTransform),
        },
    )
    .expect("core");
    Harness {
        core,
        transport,
        signal,
        keys,
        groups,
    }
}

pub fn participant_jids(stanza: &Node) -> Vec<String> {
    stanza
        .child("participants")
        .map(|p| {
            p.children_by_tag("to")
                .filter_map(|to| to.get_attr("jid").map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub fn enc_type_for(stanza: &Node, device: &str) -> Option<String> {
    stanza
        .child("participants")?
        .children_by_tag("to")
        .find(|to| to.get_attr("jid") == Some(device))?
        .child("enc")?
        .get_attr("type")
        .map(str::to_string)
}

pub async fn last_sent(transport: &MockTransport) -> Node {
    transport.sent().await.last().cloned().expect("sent node")
}
