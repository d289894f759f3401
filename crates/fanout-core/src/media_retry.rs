use crate::error::CoreError;
use crate::ids::{Jid, MessageKey};
use crate::node::Node;
use crate::transport::Transport;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use log::{debug, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

const RETRY_KEY_INFO: &[u8] = b"WhatsApp Media Retry Notification";
const IV_LEN: usize = 12;

pub const RESULT_GENERAL_ERROR: i64 = 0;
pub const RESULT_SUCCESS: i64 = 1;
pub const RESULT_NOT_FOUND: i64 = 2;

#[derive(Serialize, Deserialize)]
struct ServerErrorReceipt {
    stanza_id: String,
}

/// Decrypted body of a re-upload notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRetryResult {
    pub stanza_id: String,
    pub direct_path: Option<String>,
    pub result: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub direct_path: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryPayload {
    Encrypted { ciphertext: Vec<u8>, iv: Vec<u8> },
    Failed { code: i64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaRetryUpdate {
    pub key: MessageKey,
    pub payload: RetryPayload,
}

fn retry_key(media_key: &[u8]) -> Result<[u8; 32], CoreError> {
    let hkdf = Hkdf::<Sha256>::new(None, media_key);
    let mut out = [0u8; 32];
    hkdf.expand(RETRY_KEY_INFO, &mut out)
        .map_err(|_| CoreError::Crypto)?;
    Ok(out)
}

fn seal(media_key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CoreError> {
    let key = retry_key(media_key)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CoreError::Crypto)?;
    let mut iv = vec![0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), Payload { msg: plaintext, aad })
        .map_err(|_| CoreError::Crypto)?;
    Ok((ciphertext, iv))
}

fn open(media_key: &[u8], ciphertext: &[u8], iv: &[u8], aad: &[u8]) -> Result<Vec<u8>, CoreError> {
    if iv.len() != IV_LEN {
        return Err(CoreError::Crypto);
    }
    let key = retry_key(media_key)?;
    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CoreError::Crypto)?;
    cipher
        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
        .map_err(|_| CoreError::Crypto)
}

/// Builds the `server-error` receipt asking the sender's device to
/// re-upload the media of `key`.
pub fn encrypt_retry_request(
    key: &MessageKey,
    media_key: &[u8],
    owner: &Jid,
) -> Result<Node, CoreError> {
    let receipt = serde_json::to_vec(&ServerErrorReceipt {
        stanza_id: key.id.clone(),
    })
    .map_err(|_| CoreError::Crypto)?;
    let (ciphertext, iv) = seal(media_key, &receipt, key.id.as_bytes())?;
    let mut rmr = Node::new("rmr")
        .attr("jid", key.remote.to_string())
        .attr("from_me", key.from_me.to_string());
    if let Some(participant) = key.participant.as_ref() {
        rmr = rmr.attr("participant", participant.to_string());
    }
    Ok(Node::new("receipt")
        .attr("id", key.id.clone())
        .attr("to", owner.normalized().to_string())
        .attr("type", "server-error")
        .children(vec![
            Node::new("encrypt").children(vec![
                Node::new("enc_p").bytes(ciphertext),
                Node::new("enc_iv").bytes(iv),
            ]),
            rmr,
        ]))
}

/// Encrypts a notification body the way the re-uploading device does.
pub fn seal_notification(
    result: &MediaRetryResult,
    media_key: &[u8],
) -> Result<RetryPayload, CoreError> {
    let plaintext = serde_json::to_vec(result).map_err(|_| CoreError::Crypto)?;
    let (ciphertext, iv) = seal(media_key, &plaintext, result.stanza_id.as_bytes())?;
    Ok(RetryPayload::Encrypted { ciphertext, iv })
}

pub fn open_notification(
    ciphertext: &[u8],
    iv: &[u8],
    media_key: &[u8],
    message_id: &str,
) -> Result<MediaRetryResult, CoreError> {
    let plaintext = open(media_key, ciphertext, iv, message_id.as_bytes())?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| CoreError::MediaRetryNotification(e.to_string()))
}

pub fn decode_notification(node: &Node) -> Result<MediaRetryUpdate, CoreError> {
    let id = node
        .get_attr("id")
        .ok_or_else(|| CoreError::MediaRetryNotification("missing id".to_string()))?;
    let rmr = node
        .child("rmr")
        .ok_or_else(|| CoreError::MediaRetryNotification("missing rmr".to_string()))?;
    let remote = rmr
        .get_attr("jid")
        .ok_or_else(|| CoreError::MediaRetryNotification("missing jid".to_string()))
        .and_then(Jid::parse)?;
    let participant = rmr.get_attr("participant").map(Jid::parse).transpose()?;
    let key = MessageKey {
        remote,
        id: id.to_string(),
        from_me: rmr.get_attr("from_me") == Some("true"),
        participant,
    };

    let payload = if let Some(error) = node.child("error") {
        let code = error
            .get_attr("code")
            .and_then(|c| c.parse::<i64>().ok())
            .unwrap_or(RESULT_GENERAL_ERROR);
        RetryPayload::Failed { code }
    } else {
        let encrypted = node.child("encrypt");
        let ciphertext = encrypted
            .and_then(|e| e.child("enc_p"))
            .and_then(|n| n.content_bytes());
        let iv = encrypted
            .and_then(|e| e.child("enc_iv"))
            .and_then(|n| n.content_bytes());
        match (ciphertext, iv) {
            (Some(ciphertext), Some(iv)) => RetryPayload::Encrypted {
                ciphertext: ciphertext.to_vec(),
                iv: iv.to_vec(),
            },
            _ => RetryPayload::Failed {
                code: RESULT_NOT_FOUND,
            },
        }
    };
    Ok(MediaRetryUpdate { key, payload })
}

struct Waiter {
    token: u64,
    tx: oneshot::Sender<RetryPayload>,
}

type PendingMap = HashMap<String, Vec<Waiter>>;

/// Removes its waiter when the request finishes or is abandoned.
struct PendingGuard {
    pending: Arc<Mutex<PendingMap>>,
    id: String,
    token: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(waiters) = pending.get_mut(&self.id) {
                waiters.retain(|w| w.token != self.token);
                if waiters.is_empty() {
                    pending.remove(&self.id);
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct MediaRetryCoordinator {
    transport: Arc<dyn Transport>,
    download_host: String,
    pending: Arc<Mutex<PendingMap>>,
    next_token: Arc<AtomicU64>,
}

impl MediaRetryCoordinator {
    pub fn new(transport: Arc<dyn Transport>, download_host: String) -> Self {
        Self {
            transport,
            download_host,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_token: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn url_for(&self, direct_path: &str) -> String {
        format!("https://{}{}", self.download_host, direct_path)
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .map(|p| p.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn register(
        &self,
        id: &str,
    ) -> Result<(PendingGuard, oneshot::Receiver<RetryPayload>), CoreError> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .map_err(|_| CoreError::Storage)?
            .entry(id.to_string())
            .or_default()
            .push(Waiter { token, tx });
        let guard = PendingGuard {
            pending: self.pending.clone(),
            id: id.to_string(),
            token,
        };
        Ok((guard, rx))
    }

    /// Sends the re-upload request and waits for the matching notification.
    /// There is no timeout here; callers bound the wait themselves.
    pub async fn request_retry(
        &self,
        key: &MessageKey,
        media_key: &[u8],
        owner: &Jid,
    ) -> Result<ResolvedMedia, CoreError> {
        let request = encrypt_retry_request(key, media_key, owner)?;
        // registered before sending so a fast reply is not missed
        let (_guard, rx) = self.register(&key.id)?;
        self.transport.send(request).await?;
        let payload = rx.await.map_err(|_| {
            CoreError::MediaRetryNotification(format!("waiter for {} closed", key.id))
        })?;

        let (ciphertext, iv) = match payload {
            RetryPayload::Failed { code } => return Err(CoreError::MediaRetryFailed { code }),
            RetryPayload::Encrypted { ciphertext, iv } => (ciphertext, iv),
        };
        let result = open_notification(&ciphertext, &iv, media_key, &key.id)?;
        if result.result != RESULT_SUCCESS {
            return Err(CoreError::MediaRetryFailed {
                code: result.result,
            });
        }
        let direct_path = result
            .direct_path
            .ok_or_else(|| CoreError::MediaRetryNotification("missing direct path".to_string()))?;
        debug!("media update successful id={}", key.id);
        Ok(ResolvedMedia {
            url: self.url_for(&direct_path),
            direct_path,
        })
    }

    /// Completes every waiter for the notification's message id. Returns
    /// whether anyone was waiting.
    pub fn handle_notification(&self, node: &Node) -> Result<bool, CoreError> {
        let update = decode_notification(node)?;
        self.complete(update)
    }

    pub fn complete(&self, update: MediaRetryUpdate) -> Result<bool, CoreError> {
        let waiters = self
            .pending
            .lock()
            .map_err(|_| CoreError::Storage)?
            .remove(&update.key.id)
            .unwrap_or_default();
        if waiters.is_empty() {
            warn!("media retry notification without waiter id={}", update.key.id);
            return Ok(false);
        }
        for waiter in waiters {
            let _ = waiter.tx.send(update.payload.clone());
        }
        Ok(true)
    }
}
