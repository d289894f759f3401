use crate::error::CoreError;
use crate::ids::Jid;
use crate::node::Node;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fire-and-forget transmission of a node.
    async fn send(&self, node: Node) -> Result<(), CoreError>;
    /// Request/response exchange; the reply is the server's result node.
    async fn query(&self, node: Node) -> Result<Node, CoreError>;
}

/// In-process transport answering the queries this crate issues from a
/// configurable device registry.
#[derive(Clone, Default)]
pub struct MockTransport {
    sent: Arc<Mutex<Vec<Node>>>,
    queries: Arc<Mutex<Vec<Node>>>,
    devices: Arc<Mutex<HashMap<String, Vec<u16>>>>,
    keyless: Arc<Mutex<HashSet<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    media_conn: Arc<Mutex<Option<Node>>>,
    fail_sends: Arc<AtomicBool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_devices(&self, user: &str, devices: Vec<u16>) {
        self.devices.lock().await.insert(user.to_string(), devices);
    }

    /// Key fetches leave this device address out of the response.
    pub async fn withhold_keys(&self, jid: &Jid) {
        self.keyless.lock().await.insert(jid.to_string());
    }

    pub async fn fail_queries(&self, xmlns: &str) {
        self.failing.lock().await.insert(xmlns.to_string());
    }

    pub async fn set_media_conn(&self, node: Node) {
        *self.media_conn.lock().await = Some(node);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<Node> {
        self.sent.lock().await.clone()
    }

    pub async fn queries(&self) -> Vec<Node> {
        self.queries.lock().await.clone()
    }

    pub async fn query_count(&self, xmlns: &str) -> usize {
        self.queries
            .lock()
            .await
            .iter()
            .filter(|q| q.get_attr("xmlns") == Some(xmlns))
            .count()
    }

    async fn answer_usync(&self, node: &Node) -> Node {
        let devices = self.devices.lock().await;
        let mut users = Vec::new();
        let requested = node
            .child("usync")
            .and_then(|u| u.child("list"))
            .map(|l| l.child_nodes().to_vec())
            .unwrap_or_default();
        for user in requested.iter() {
            let Some(jid) = user.get_attr("jid") else {
                continue;
            };
            let Ok(parsed) = Jid::parse(jid) else {
                continue;
            };
            let entries = devices
                .get(&parsed.user)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|id| {
                    let device = Node::new("device").attr("id", id.to_string());
                    if id > 0 {
                        device.attr("key-index", "1")
                    } else {
                        device
                    }
                })
                .collect();
            users.push(
                Node::new("user").attr("jid", jid).children(vec![Node::new("devices")
                    .children(vec![Node::new("device-list").children(entries)])]),
            );
        }
        Node::new("iq").attr("type", "result").children(vec![
            Node::new("usync").children(vec![Node::new("list").children(users)])
        ])
    }

    async fn answer_encrypt(&self, node: &Node) -> Node {
        let keyless = self.keyless.lock().await;
        let users = node
            .child("key")
            .map(|k| k.child_nodes().to_vec())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|user| {
                let jid = user.get_attr("jid")?.to_string();
                if keyless.contains(&jid) {
                    return None;
                }
                let bundle = Node::new("key-bundle").bytes(jid.as_bytes().to_vec());
                Some(Node::new("user").attr("jid", jid).children(vec![bundle]))
            })
            .collect();
        Node::new("iq")
            .attr("type", "result")
            .children(vec![Node::new("list").children(users)])
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, node: Node) -> Result<(), CoreError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CoreError::Transport("send".to_string()));
        }
        self.sent.lock().await.push(node);
        Ok(())
    }

    async fn query(&self, node: Node) -> Result<Node, CoreError> {
        self.queries.lock().await.push(node.clone());
        let xmlns = node.get_attr("xmlns").unwrap_or_default().to_string();
        if self.failing.lock().await.contains(&xmlns) {
            return Err(CoreError::Transport(format!("query {}", xmlns)));
        }
        match xmlns.as_str() {
            "usync" => Ok(self.answer_usync(&node).await),
            "encrypt" => Ok(self.answer_encrypt(&node).await),
            "w:m" => self
                .media_conn
                .lock()
                .await
                .clone()
                .map(|conn| Node::new("iq").attr("type", "result").children(vec![conn]))
                .ok_or_else(|| CoreError::Transport("media_conn".to_string())),
            _ => Ok(Node::new("iq").attr("type", "result").children(node.child_nodes().to_vec())),
        }
    }
}
