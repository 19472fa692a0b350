use crate::inventory::{Bridge, NicAttachment, PoolInfo, VmConfig, VmSummary};
use crate::{next_slot, random_mac, DriverError, Hypervisor, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fixed cache expiries. The reachability probe is the only shared mutable
/// state consulted by every call; the read caches just keep a chatty admin
/// UI from hammering the cluster.
const REACHABLE_TTL: Duration = Duration::from_secs(15);
const BRIDGES_TTL: Duration = Duration::from_secs(20);
const VM_LIST_TTL: Duration = Duration::from_secs(10);
const VM_DETAIL_TTL: Duration = Duration::from_secs(10);

/// Process-wide TTL cache. Entries expire individually; expired entries are
/// dropped on read.
pub(crate) struct TtlCache<K, V> {
    ttl: Duration,
    inner: Mutex<HashMap<K, (Instant, V)>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(key) {
            Some((at, v)) if at.elapsed() < self.ttl => Some(v.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub(crate) fn insert(&self, key: K, value: V) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(key, (Instant::now(), value));
    }

    pub(crate) fn invalidate(&self, key: &K) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
    }
}

pub struct ProxmoxConfig {
    /// e.g. "https://pve.lab.local:8006"
    pub base_url: String,
    /// API token id: "user@realm!tokenname"
    pub token_id: String,
    pub token_secret: String,
    pub verify_ssl: bool,
}

pub struct ProxmoxHypervisor {
    client: Client,
    base_url: String,
    token_id: String,
    token_secret: String,

    reachable_cache: TtlCache<(), bool>,
    bridges_cache: TtlCache<String, Vec<Bridge>>,
    vm_list_cache: TtlCache<String, Vec<VmSummary>>,
    vm_detail_cache: TtlCache<i64, VmSummary>,
}

impl ProxmoxHypervisor {
    pub fn new(config: ProxmoxConfig) -> Result<Self> {
        // No overall timeout on the default client; a stalled cluster call
        // would hang a provisioning step forever.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| DriverError::vendor(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token_id: config.token_id.trim().to_string(),
            token_secret: config.token_secret.trim().to_string(),
            reachable_cache: TtlCache::new(REACHABLE_TTL),
            bridges_cache: TtlCache::new(BRIDGES_TTL),
            vm_list_cache: TtlCache::new(VM_LIST_TTL),
            vm_detail_cache: TtlCache::new(VM_DETAIL_TTL),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api2/json{}", self.base_url, path)
    }

    fn auth_header(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.token_secret)
    }

    fn transport_failure(&self, e: reqwest::Error) -> DriverError {
        // A transport fault flips the cached probe so every caller fails
        // fast until the TTL expires and we probe again.
        self.reachable_cache.insert((), false);
        DriverError::NotConnected(e.to_string())
    }

    async fn probe(&self) -> bool {
        let resp = self
            .client
            .get(self.url("/version"))
            .header("Authorization", self.auth_header())
            .send()
            .await;
        matches!(resp, Ok(r) if r.status().is_success())
    }

    /// Every call goes through here first: consult the cached probe and
    /// fail fast with NotConnected when the cluster is down.
    async fn gate(&self) -> Result<()> {
        let up = match self.reachable_cache.get(&()) {
            Some(cached) => cached,
            None => {
                let up = self.probe().await;
                self.reachable_cache.insert((), up);
                up
            }
        };
        if up {
            Ok(())
        } else {
            Err(DriverError::NotConnected(
                "reachability probe negative".to_string(),
            ))
        }
    }

    async fn api_get(&self, path: &str) -> Result<serde_json::Value> {
        self.gate().await?;
        let resp = self
            .client
            .get(self.url(path))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| self.transport_failure(e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(DriverError::vendor(format!(
                "GET {} failed: {} - {}",
                path, status, text
            )));
        }
        resp.json()
            .await
            .map_err(|e| DriverError::vendor(format!("GET {}: invalid JSON: {}", path, e)))
    }

    /// GET where 404 (or the cluster's "does not exist" 500) means absent.
    async fn api_get_optional(&self, path: &str) -> Result<Option<serde_json::Value>> {
        self.gate().await?;
        let resp = self
            .client
            .get(self.url(path))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| self.transport_failure(e))?;

        let status = resp.status();
        if status.is_success() {
            let v = resp
                .json()
                .await
                .map_err(|e| DriverError::vendor(format!("GET {}: invalid JSON: {}", path, e)))?;
            return Ok(Some(v));
        }
        let text = resp.text().await.unwrap_or_default();
        if status.as_u16() == 404 || text.contains("does not exist") {
            return Ok(None);
        }
        Err(DriverError::vendor(format!(
            "GET {} failed: {} - {}",
            path, status, text
        )))
    }

    async fn api_send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value> {
        self.gate().await?;
        let mut req = self
            .client
            .request(method.clone(), self.url(path))
            .header("Authorization", self.auth_header());
        if let Some(b) = body {
            req = req.json(b);
        }
        let resp = req.send().await.map_err(|e| self.transport_failure(e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(DriverError::vendor(format!(
                "{} {} failed: {} - {}",
                method, path, status, text
            )));
        }
        Ok(resp.json().await.unwrap_or(serde_json::Value::Null))
    }

    // --- Precondition guards ------------------------------------------------
    // Each mutating call re-checks the referenced remote entity first.
    // Violations surface as DriverError::Vendor; no rollback of earlier
    // remote effects is attempted here (the workflow owns compensation).

    async fn vm_exists(&self, node: &str, vmid: i64) -> Result<bool> {
        if self.vm_detail_cache.get(&vmid).is_some() {
            return Ok(true);
        }
        let found = self
            .api_get_optional(&format!("/nodes/{}/qemu/{}/status/current", node, vmid))
            .await?;
        Ok(found.is_some())
    }

    async fn guard_vm_exists(&self, node: &str, vmid: i64) -> Result<()> {
        if self.vm_exists(node, vmid).await? {
            Ok(())
        } else {
            Err(DriverError::vendor(format!("VM {} does not exist", vmid)))
        }
    }

    async fn guard_bridge_exists(&self, node: &str, bridge: &str) -> Result<()> {
        let bridges = self.list_bridges(node).await?;
        if bridges.iter().any(|b| b.iface == bridge) {
            Ok(())
        } else {
            Err(DriverError::vendor(format!(
                "Network {} does not exist",
                bridge
            )))
        }
    }

    async fn guard_pool(&self, poolid: &str, should_exist: bool) -> Result<()> {
        let pools = self.list_pools().await?;
        let exists = pools.iter().any(|p| p == poolid);
        if exists == should_exist {
            Ok(())
        } else if should_exist {
            Err(DriverError::vendor(format!("Pool {} doesn't exist", poolid)))
        } else {
            Err(DriverError::vendor(format!(
                "Pool {} already exists",
                poolid
            )))
        }
    }

    async fn guard_vm_has_nic(&self, node: &str, vmid: i64, nic: &str) -> Result<()> {
        let config = self.get_vm_config(node, vmid).await?;
        if config.contains_key(nic) {
            Ok(())
        } else {
            Err(DriverError::vendor(format!(
                "VM {} has no nic named {}",
                vmid, nic
            )))
        }
    }
}

fn config_post_path(node: &str, vmid: i64) -> String {
    format!("/nodes/{}/qemu/{}/config", node, vmid)
}

#[async_trait]
impl Hypervisor for ProxmoxHypervisor {
    async fn reachable(&self) -> bool {
        match self.reachable_cache.get(&()) {
            Some(cached) => cached,
            None => {
                let up = self.probe().await;
                self.reachable_cache.insert((), up);
                up
            }
        }
    }

    async fn list_bridges(&self, node: &str) -> Result<Vec<Bridge>> {
        if let Some(cached) = self.bridges_cache.get(&node.to_string()) {
            return Ok(cached);
        }
        let v = self
            .api_get(&format!("/nodes/{}/network?type=bridge", node))
            .await?;
        let bridges: Vec<Bridge> = v["data"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| {
                let iface = item["iface"].as_str()?.to_string();
                Some(Bridge {
                    iface,
                    active: item["active"].as_i64().unwrap_or(0) == 1
                        || item["active"].as_bool().unwrap_or(false),
                    comment: item["comments"].as_str().map(|s| s.trim().to_string()),
                })
            })
            .collect();
        self.bridges_cache.insert(node.to_string(), bridges.clone());
        Ok(bridges)
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<VmSummary>> {
        if let Some(cached) = self.vm_list_cache.get(&node.to_string()) {
            return Ok(cached);
        }
        let v = self.api_get(&format!("/nodes/{}/qemu", node)).await?;
        let vms: Vec<VmSummary> = v["data"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| {
                Some(VmSummary {
                    vmid: item["vmid"].as_i64()?,
                    name: item["name"].as_str().unwrap_or_default().to_string(),
                    status: item["status"].as_str().unwrap_or_default().to_string(),
                })
            })
            .collect();
        self.vm_list_cache.insert(node.to_string(), vms.clone());
        Ok(vms)
    }

    async fn get_vm(&self, node: &str, vmid: i64) -> Result<VmSummary> {
        if let Some(cached) = self.vm_detail_cache.get(&vmid) {
            return Ok(cached);
        }
        let found = self
            .api_get_optional(&format!("/nodes/{}/qemu/{}/status/current", node, vmid))
            .await?;
        let Some(v) = found else {
            return Err(DriverError::vendor(format!("VM {} does not exist", vmid)));
        };
        let summary = VmSummary {
            vmid,
            name: v["data"]["name"].as_str().unwrap_or_default().to_string(),
            status: v["data"]["status"].as_str().unwrap_or_default().to_string(),
        };
        self.vm_detail_cache.insert(vmid, summary.clone());
        Ok(summary)
    }

    async fn get_vm_config(&self, node: &str, vmid: i64) -> Result<VmConfig> {
        let found = self
            .api_get_optional(&format!("/nodes/{}/qemu/{}/config", node, vmid))
            .await?;
        let Some(v) = found else {
            return Err(DriverError::vendor(format!("VM {} does not exist", vmid)));
        };
        let mut config = VmConfig::new();
        if let Some(obj) = v["data"].as_object() {
            for (k, val) in obj {
                let s = match val {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                config.insert(k.clone(), s);
            }
        }
        Ok(config)
    }

    async fn list_pools(&self) -> Result<Vec<String>> {
        let v = self.api_get("/pools").await?;
        Ok(v["data"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| p["poolid"].as_str().map(|s| s.to_string()))
            .collect())
    }

    async fn get_pool(&self, poolid: &str) -> Result<PoolInfo> {
        let found = self.api_get_optional(&format!("/pools/{}", poolid)).await?;
        let Some(v) = found else {
            return Err(DriverError::vendor(format!("Pool {} doesn't exist", poolid)));
        };
        let members = v["data"]["members"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m["vmid"].as_i64())
            .collect();
        Ok(PoolInfo {
            poolid: poolid.to_string(),
            comment: v["data"]["comment"].as_str().map(|s| s.to_string()),
            members,
        })
    }

    async fn next_vmid(&self) -> Result<i64> {
        let v = self.api_get("/cluster/nextid").await?;
        match &v["data"] {
            serde_json::Value::String(s) => s
                .parse::<i64>()
                .map_err(|_| DriverError::vendor(format!("Unparsable nextid: {}", s))),
            serde_json::Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| DriverError::vendor("Unparsable nextid".to_string())),
            other => Err(DriverError::vendor(format!(
                "Unexpected nextid payload: {}",
                other
            ))),
        }
    }

    async fn create_pool(&self, poolid: &str, comment: &str) -> Result<()> {
        self.guard_pool(poolid, false).await?;
        self.api_send(
            reqwest::Method::POST,
            "/pools",
            Some(&json!({"poolid": poolid, "comment": comment})),
        )
        .await?;
        Ok(())
    }

    async fn delete_pool(&self, poolid: &str) -> Result<()> {
        self.guard_pool(poolid, true).await?;
        self.api_send(reqwest::Method::DELETE, &format!("/pools/{}", poolid), None)
            .await?;
        Ok(())
    }

    async fn clone_vm(
        &self,
        node: &str,
        template: i64,
        newid: i64,
        name: &str,
        pool: Option<&str>,
    ) -> Result<i64> {
        self.guard_vm_exists(node, template).await?;
        let mut body = json!({"newid": newid, "name": name, "full": true});
        if let Some(p) = pool {
            body["pool"] = json!(p);
        }
        self.api_send(
            reqwest::Method::POST,
            &format!("/nodes/{}/qemu/{}/clone", node, template),
            Some(&body),
        )
        .await?;
        self.vm_list_cache.invalidate(&node.to_string());
        Ok(newid)
    }

    async fn set_ram(&self, node: &str, vmid: i64, max_mb: i64, min_mb: i64) -> Result<()> {
        self.guard_vm_exists(node, vmid).await?;
        self.api_send(
            reqwest::Method::POST,
            &config_post_path(node, vmid),
            Some(&json!({"balloon": min_mb, "memory": max_mb})),
        )
        .await?;
        Ok(())
    }

    async fn set_cores(&self, node: &str, vmid: i64, cores: i32) -> Result<()> {
        self.guard_vm_exists(node, vmid).await?;
        self.api_send(
            reqwest::Method::POST,
            &config_post_path(node, vmid),
            Some(&json!({"cores": cores})),
        )
        .await?;
        Ok(())
    }

    async fn attach_nic(&self, node: &str, vmid: i64, bridge: &str) -> Result<NicAttachment> {
        self.guard_vm_exists(node, vmid).await?;
        self.guard_bridge_exists(node, bridge).await?;

        let config = self.get_vm_config(node, vmid).await?;
        let slot_index = next_slot(config.keys().map(|k| k.as_str()), "net");
        let slot = format!("net{}", slot_index);
        let mac = random_mac();

        let mut body = serde_json::Map::new();
        body.insert(
            slot.clone(),
            json!(format!("model=virtio,bridge={},macaddr={}", bridge, mac)),
        );
        self.api_send(
            reqwest::Method::POST,
            &config_post_path(node, vmid),
            Some(&serde_json::Value::Object(body)),
        )
        .await?;

        Ok(NicAttachment {
            iface: format!("eth{}", slot_index),
            slot,
            mac,
        })
    }

    async fn detach_nic(&self, node: &str, vmid: i64, nic: &str) -> Result<()> {
        self.guard_vm_exists(node, vmid).await?;
        self.guard_vm_has_nic(node, vmid, nic).await?;
        self.api_send(
            reqwest::Method::POST,
            &config_post_path(node, vmid),
            Some(&json!({"delete": nic})),
        )
        .await?;
        Ok(())
    }

    async fn delete_vm(&self, node: &str, vmid: i64) -> Result<()> {
        self.guard_vm_exists(node, vmid).await?;
        self.api_send(
            reqwest::Method::DELETE,
            &format!("/nodes/{}/qemu/{}", node, vmid),
            None,
        )
        .await?;
        self.vm_detail_cache.invalidate(&vmid);
        self.vm_list_cache.invalidate(&node.to_string());
        Ok(())
    }

    async fn set_cloud_init(
        &self,
        node: &str,
        vmid: i64,
        ipconfig: &str,
        password: Option<&str>,
    ) -> Result<()> {
        self.guard_vm_exists(node, vmid).await?;
        let mut body = json!({"ipconfig0": ipconfig});
        if let Some(pwd) = password {
            body["cipassword"] = json!(pwd);
        }
        self.api_send(
            reqwest::Method::POST,
            &config_post_path(node, vmid),
            Some(&body),
        )
        .await?;
        Ok(())
    }

    async fn attach_cloud_init_drive(&self, node: &str, vmid: i64, storage: &str) -> Result<()> {
        self.guard_vm_exists(node, vmid).await?;
        self.api_send(
            reqwest::Method::POST,
            &config_post_path(node, vmid),
            Some(&json!({"ide2": format!("{}:cloudinit", storage)})),
        )
        .await?;
        Ok(())
    }

    async fn create_volume(
        &self,
        node: &str,
        storage: &str,
        vmid: i64,
        name: &str,
        size_gb: i64,
    ) -> Result<String> {
        let v = self
            .api_send(
                reqwest::Method::POST,
                &format!("/nodes/{}/storage/{}/content", node, storage),
                Some(&json!({
                    "filename": name,
                    "size": format!("{}G", size_gb),
                    "vmid": vmid,
                    "format": "raw",
                })),
            )
            .await?;
        // The API returns the allocated volume id ("storage:vm-101-disk-1").
        Ok(v["data"]
            .as_str()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("{}:{}", storage, name)))
    }

    async fn attach_volume(&self, node: &str, vmid: i64, volid: &str) -> Result<String> {
        self.guard_vm_exists(node, vmid).await?;
        let config = self.get_vm_config(node, vmid).await?;
        let slot = format!(
            "scsi{}",
            next_slot(config.keys().map(|k| k.as_str()), "scsi")
        );
        let mut body = serde_json::Map::new();
        body.insert(slot.clone(), json!(volid));
        self.api_send(
            reqwest::Method::POST,
            &config_post_path(node, vmid),
            Some(&serde_json::Value::Object(body)),
        )
        .await?;
        Ok(slot)
    }

    async fn delete_volume(&self, node: &str, storage: &str, volid: &str) -> Result<()> {
        self.api_send(
            reqwest::Method::DELETE,
            &format!("/nodes/{}/storage/{}/content/{}", node, storage, volid),
            None,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_cache_returns_fresh_entries() {
        let cache: TtlCache<String, i32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
    }

    #[test]
    fn ttl_cache_expires_entries() {
        let cache: TtlCache<(), bool> = TtlCache::new(Duration::from_millis(20));
        cache.insert((), true);
        assert_eq!(cache.get(&()), Some(true));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&()), None);
    }

    #[test]
    fn ttl_cache_overwrite_refreshes_entry() {
        let cache: TtlCache<(), bool> = TtlCache::new(Duration::from_millis(50));
        cache.insert((), true);
        cache.insert((), false);
        assert_eq!(cache.get(&()), Some(false));
    }

    #[test]
    fn ttl_cache_invalidate_removes_entry() {
        let cache: TtlCache<i64, VmSummary> = TtlCache::new(Duration::from_secs(60));
        cache.insert(
            101,
            VmSummary {
                vmid: 101,
                name: "web".to_string(),
                status: "running".to_string(),
            },
        );
        cache.invalidate(&101);
        assert!(cache.get(&101).is_none());
    }
}
