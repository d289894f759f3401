use crate::error::CoreError;
use crate::ids::{Device, Jid};
use crate::node::Node;
use crate::transport::Transport;
use log::{debug, trace};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Clone, Debug)]
struct CachedDevices {
    devices: Vec<Device>,
    stored_at: Instant,
}

/// Resolves users to their registered devices, caching each user's full
/// device list for a fixed TTL. Entries are replaced wholesale.
#[derive(Clone)]
pub struct DeviceDirectory {
    transport: Arc<dyn Transport>,
    server: String,
    own: Jid,
    ttl: Duration,
    cache: Arc<Mutex<HashMap<String, CachedDevices>>>,
}

impl DeviceDirectory {
    pub fn new(transport: Arc<dyn Transport>, server: String, own: Jid, ttl: Duration) -> Self {
        Self {
            transport,
            server,
            own,
            ttl,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn resolve(
        &self,
        jids: &[Jid],
        use_cache: bool,
        ignore_zero_devices: bool,
    ) -> Result<Vec<Device>, CoreError> {
        if !use_cache {
            debug!("not using cache for devices");
        }
        let mut results = Vec::new();
        let mut to_fetch = Vec::new();
        let mut seen = HashSet::new();
        for jid in jids.iter() {
            let normalized = jid.normalized();
            if !seen.insert(normalized.clone()) {
                continue;
            }
            if use_cache {
                if let Some(devices) = self.cached(&normalized.user).await {
                    trace!("using cache for devices user={}", normalized.user);
                    results.extend(
                        devices
                            .into_iter()
                            .filter(|d| !ignore_zero_devices || d.device != 0),
                    );
                    continue;
                }
            }
            to_fetch.push(normalized);
        }
        if to_fetch.is_empty() {
            return Ok(results);
        }

        let response = self
            .transport
            .query(self.usync_query(&to_fetch))
            .await
            .map_err(|e| CoreError::Directory(format!("usync users={}: {}", to_fetch.len(), e)))?;
        // the cache keeps every device; device 0 is only dropped from this call's answer
        let extracted = self.extract_devices(&response, false);
        let mut by_user: HashMap<String, Vec<Device>> = HashMap::new();
        for device in extracted.into_iter() {
            by_user
                .entry(device.user.clone())
                .or_default()
                .push(device.clone());
            if !ignore_zero_devices || device.device != 0 {
                results.push(device);
            }
        }
        let mut cache = self.cache.lock().await;
        for (user, devices) in by_user.into_iter() {
            cache.insert(
                user,
                CachedDevices {
                    devices,
                    stored_at: Instant::now(),
                },
            );
        }
        Ok(results)
    }

    pub async fn invalidate(&self, user: &str) {
        self.cache.lock().await.remove(user);
    }

    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }

    async fn cached(&self, user: &str) -> Option<Vec<Device>> {
        let mut cache = self.cache.lock().await;
        let entry = cache.get(user)?;
        if entry.stored_at.elapsed() > self.ttl {
            cache.remove(user);
            return None;
        }
        Some(entry.devices.clone())
    }

    fn usync_query(&self, users: &[Jid]) -> Node {
        let sid: u32 = rand::thread_rng().gen();
        let list = users
            .iter()
            .map(|jid| Node::new("user").attr("jid", jid.to_string()))
            .collect();
        Node::new("iq")
            .attr("to", self.server.clone())
            .attr("type", "get")
            .attr("xmlns", "usync")
            .children(vec![Node::new("usync")
                .attr("sid", sid.to_string())
                .attr("mode", "query")
                .attr("last", "true")
                .attr("index", "0")
                .attr("context", "message")
                .children(vec![
                    Node::new("query")
                        .children(vec![Node::new("devices").attr("version", "2")]),
                    Node::new("list").children(list),
                ])])
    }

    /// Keeps a device iff zero devices are allowed (or it is not device 0),
    /// it is not this exact device, and non-primary devices carry a key index.
    fn extract_devices(&self, response: &Node, ignore_zero_devices: bool) -> Vec<Device> {
        let mut out = Vec::new();
        let Some(list) = response.child("usync").and_then(|u| u.child("list")) else {
            return out;
        };
        for user in list.children_by_tag("user") {
            let Some(jid) = user.get_attr("jid").and_then(|j| Jid::parse(j).ok()) else {
                continue;
            };
            let Some(device_list) = user.child("devices").and_then(|d| d.child("device-list"))
            else {
                continue;
            };
            for entry in device_list.children_by_tag("device") {
                let Some(id) = entry.get_attr("id").and_then(|v| v.parse::<u16>().ok()) else {
                    continue;
                };
                let has_key_index = entry.get_attr("key-index").is_some();
                let is_self = jid.user == self.own.user && id == self.own.device;
                if (!ignore_zero_devices || id != 0) && !is_self && (id == 0 || has_key_index) {
                    out.push(Device::new(jid.user.clone(), id));
                }
            }
        }
        out
    }
}
