use crate::error::CoreError;
use crate::ids::Jid;
use async_trait::async_trait;
use blake3::Hasher;
use rand::RngCore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

pub type ProtocolAddress = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EncType {
    /// First-contact form carrying the session-establishing pre-key.
    PreKey,
    Normal,
    SenderKey,
}

impl EncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncType::PreKey => "pkmsg",
            EncType::Normal => "msg",
            EncType::SenderKey => "skmsg",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCiphertext {
    pub enc_type: EncType,
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupCiphertext {
    pub ciphertext: Vec<u8>,
    pub distribution_payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyBundle {
    pub jid: Jid,
    pub bundle: Vec<u8>,
}

/// End-to-end session layer. Session state is owned here; the engine only
/// asks whether one exists and hands over fetched key bundles.
#[async_trait]
pub trait SignalRepository: Send + Sync {
    fn address_for(&self, jid: &Jid) -> ProtocolAddress;
    async fn session_exists(
        &self,
        addresses: &[ProtocolAddress],
    ) -> Result<HashMap<ProtocolAddress, bool>, CoreError>;
    async fn inject_key_bundles(&self, bundles: Vec<KeyBundle>) -> Result<(), CoreError>;
    async fn encrypt_for_device(
        &self,
        jid: &Jid,
        plaintext: &[u8],
    ) -> Result<DeviceCiphertext, CoreError>;
    async fn encrypt_for_group(
        &self,
        group: &Jid,
        plaintext: &[u8],
        me: &Jid,
    ) -> Result<GroupCiphertext, CoreError>;
}

pub fn protocol_address(jid: &Jid) -> ProtocolAddress {
    if jid.is_lid() {
        format!("{}_1.{}", jid.user, jid.device)
    } else {
        format!("{}.{}", jid.user, jid.device)
    }
}

struct SessionEntry {
    seed: [u8; 32],
    acknowledged: bool,
    counter: u64,
}

/// Keystream-based stand-in for the session layer, suitable for tests and
/// local tooling. Sessions stay in pre-key form until acknowledged.
#[derive(Clone, Default)]
pub struct InMemorySignalRepository {
    sessions: Arc<Mutex<HashMap<ProtocolAddress, SessionEntry>>>,
    sender_keys: Arc<Mutex<HashMap<String, ([u8; 32], u64)>>>,
    failing: Arc<Mutex<HashSet<ProtocolAddress>>>,
}

impl InMemorySignalRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an established session, as if the peer already replied.
    pub async fn establish(&self, jid: &Jid) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            protocol_address(jid),
            SessionEntry {
                seed: seed_for(jid.to_string().as_bytes()),
                acknowledged: true,
                counter: 0,
            },
        );
    }

    pub async fn fail_encryption_for(&self, jid: &Jid) {
        self.failing.lock().await.insert(protocol_address(jid));
    }

    pub async fn has_session(&self, jid: &Jid) -> bool {
        self.sessions.lock().await.contains_key(&protocol_address(jid))
    }
}

#[async_trait]
impl SignalRepository for InMemorySignalRepository {
    fn address_for(&self, jid: &Jid) -> ProtocolAddress {
        protocol_address(jid)
    }

    async fn session_exists(
        &self,
        addresses: &[ProtocolAddress],
    ) -> Result<HashMap<ProtocolAddress, bool>, CoreError> {
        let sessions = self.sessions.lock().await;
        Ok(addresses
            .iter()
            .map(|a| (a.clone(), sessions.contains_key(a)))
            .collect())
    }

    async fn inject_key_bundles(&self, bundles: Vec<KeyBundle>) -> Result<(), CoreError> {
        let mut sessions = self.sessions.lock().await;
        for bundle in bundles {
            if bundle.bundle.is_empty() {
                return Err(CoreError::Crypto);
            }
            sessions.insert(
                protocol_address(&bundle.jid),
                SessionEntry {
                    seed: seed_for(&bundle.bundle),
                    acknowledged: false,
                    counter: 0,
                },
            );
        }
        Ok(())
    }

    async fn encrypt_for_device(
        &self,
        jid: &Jid,
        plaintext: &[u8],
    ) -> Result<DeviceCiphertext, CoreError> {
        let address = protocol_address(jid);
        if self.failing.lock().await.contains(&address) {
            return Err(CoreError::Crypto);
        }
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(&address).ok_or(CoreError::NotFound)?;
        let ciphertext = keystream_xor(&entry.seed, entry.counter, plaintext);
        entry.counter = entry.counter.saturating_add(1);
        let enc_type = if entry.acknowledged {
            EncType::Normal
        } else {
            EncType::PreKey
        };
        Ok(DeviceCiphertext {
            enc_type,
            ciphertext,
        })
    }

    async fn encrypt_for_group(
        &self,
        group: &Jid,
        plaintext: &[u8],
        me: &Jid,
    ) -> Result<GroupCiphertext, CoreError> {
        let name = format!("{}::{}", group, protocol_address(me));
        let mut keys = self.sender_keys.lock().await;
        let (chain, index) = keys.entry(name).or_insert_with(|| {
            let mut chain = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut chain);
            (chain, 0)
        });
        let ciphertext = keystream_xor(chain, *index, plaintext);
        let mut distribution_payload = chain.to_vec();
        distribution_payload.extend_from_slice(&index.to_be_bytes());
        *index = index.saturating_add(1);
        Ok(GroupCiphertext {
            ciphertext,
            distribution_payload,
        })
    }
}

fn seed_for(material: &[u8]) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(b"fanout:session_seed:v1");
    hasher.update(material);
    hasher.finalize().into()
}

fn keystream_xor(seed: &[u8; 32], counter: u64, data: &[u8]) -> Vec<u8> {
    let mut hasher = Hasher::new_keyed(seed);
    hasher.update(&counter.to_be_bytes());
    let mut stream = vec![0u8; data.len()];
    hasher.finalize_xof().fill(&mut stream);
    data.iter().zip(stream.iter()).map(|(d, k)| d ^ k).collect()
}
