use crate::error::CoreError;
use crate::node::Node;
use crate::transport::Transport;
use log::debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaHost {
    pub hostname: String,
    pub max_content_length_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaConnection {
    pub hosts: Vec<MediaHost>,
    pub auth: String,
    pub ttl_secs: u64,
    pub fetched_at: Instant,
}

impl MediaConnection {
    pub fn is_stale(&self) -> bool {
        self.fetched_at.elapsed() > Duration::from_secs(self.ttl_secs)
    }

    fn from_node(node: &Node) -> Result<Self, CoreError> {
        let conn = node
            .child("media_conn")
            .ok_or_else(|| CoreError::Upstream("media_conn missing".to_string()))?;
        let hosts = conn
            .children_by_tag("host")
            .map(|host| {
                let hostname = host
                    .get_attr("hostname")
                    .ok_or_else(|| CoreError::Upstream("host without hostname".to_string()))?;
                let max = host
                    .get_attr("maxContentLengthBytes")
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(0);
                Ok(MediaHost {
                    hostname: hostname.to_string(),
                    max_content_length_bytes: max,
                })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;
        if hosts.is_empty() {
            return Err(CoreError::Upstream("media_conn without hosts".to_string()));
        }
        let ttl_secs = conn
            .get_attr("ttl")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| CoreError::Upstream("media_conn ttl".to_string()))?;
        Ok(Self {
            hosts,
            auth: conn.get_attr("auth").unwrap_or_default().to_string(),
            ttl_secs,
            fetched_at: Instant::now(),
        })
    }
}

/// Holds the one live upload descriptor. The slot lock is held across the
/// fetch so concurrent callers wait on the same in-flight request.
#[derive(Clone)]
pub struct MediaConnectionCache {
    transport: Arc<dyn Transport>,
    server: String,
    current: Arc<Mutex<Option<MediaConnection>>>,
}

impl MediaConnectionCache {
    pub fn new(transport: Arc<dyn Transport>, server: String) -> Self {
        Self {
            transport,
            server,
            current: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn get(&self, force_refresh: bool) -> Result<MediaConnection, CoreError> {
        let requested_at = Instant::now();
        let mut slot = self.current.lock().await;
        if let Some(conn) = slot.as_ref() {
            // a refresh that completed while we waited satisfies a forced call too
            let fresh_enough = !force_refresh || conn.fetched_at >= requested_at;
            if fresh_enough && !conn.is_stale() {
                return Ok(conn.clone());
            }
        }
        let query = Node::new("iq")
            .attr("type", "set")
            .attr("xmlns", "w:m")
            .attr("to", self.server.clone())
            .children(vec![Node::new("media_conn")]);
        let result = self
            .transport
            .query(query)
            .await
            .map_err(|e| CoreError::Upstream(format!("media_conn: {}", e)))?;
        let conn = MediaConnection::from_node(&result)?;
        debug!("fetched media conn hosts={} ttl={}", conn.hosts.len(), conn.ttl_secs);
        *slot = Some(conn.clone());
        Ok(conn)
    }

    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }
}
