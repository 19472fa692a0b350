use crate::inventory::{Bridge, NicAttachment, PoolInfo, VmConfig, VmSummary};
use crate::{next_slot, random_mac, DriverError, Hypervisor, Result};
use async_trait::async_trait;
use sqlx::{Pool, Postgres};

/// Postgres-backed stand-in for a real cluster. Lets the full provisioning
/// workflow run end-to-end in dev and integration tests without Proxmox.
pub struct MockHypervisor {
    db: Pool<Postgres>,
}

fn db_err(e: sqlx::Error) -> DriverError {
    DriverError::Vendor(format!("mock hypervisor db error: {}", e))
}

impl MockHypervisor {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    async fn load_config(&self, vmid: i64) -> Result<serde_json::Value> {
        let config: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT config FROM mock_hv_vms WHERE vmid = $1")
                .bind(vmid)
                .fetch_optional(&self.db)
                .await
                .map_err(db_err)?;
        config.ok_or_else(|| DriverError::vendor(format!("VM {} does not exist", vmid)))
    }

    async fn store_config(&self, vmid: i64, config: serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE mock_hv_vms SET config = $2 WHERE vmid = $1")
            .bind(vmid)
            .bind(config)
            .execute(&self.db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_config_key(&self, vmid: i64, key: &str, value: &str) -> Result<()> {
        let mut config = self.load_config(vmid).await?;
        config[key] = serde_json::json!(value);
        self.store_config(vmid, config).await
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn reachable(&self) -> bool {
        true
    }

    async fn list_bridges(&self, _node: &str) -> Result<Vec<Bridge>> {
        // Static bridge inventory, like a freshly installed single-node lab.
        Ok(vec![
            Bridge {
                iface: "vmbr0".to_string(),
                active: true,
                comment: Some("management".to_string()),
            },
            Bridge {
                iface: "vmbr1".to_string(),
                active: true,
                comment: Some("lab targets".to_string()),
            },
        ])
    }

    async fn list_vms(&self, node: &str) -> Result<Vec<VmSummary>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT vmid, name FROM mock_hv_vms WHERE node = $1 ORDER BY vmid")
                .bind(node)
                .fetch_all(&self.db)
                .await
                .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|(vmid, name)| VmSummary {
                vmid,
                name,
                status: "running".to_string(),
            })
            .collect())
    }

    async fn get_vm(&self, _node: &str, vmid: i64) -> Result<VmSummary> {
        let name: Option<String> = sqlx::query_scalar("SELECT name FROM mock_hv_vms WHERE vmid = $1")
            .bind(vmid)
            .fetch_optional(&self.db)
            .await
            .map_err(db_err)?;
        match name {
            Some(name) => Ok(VmSummary {
                vmid,
                name,
                status: "running".to_string(),
            }),
            None => Err(DriverError::vendor(format!("VM {} does not exist", vmid))),
        }
    }

    async fn get_vm_config(&self, _node: &str, vmid: i64) -> Result<VmConfig> {
        let raw = self.load_config(vmid).await?;
        let mut config = VmConfig::new();
        if let Some(obj) = raw.as_object() {
            for (k, v) in obj {
                let s = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                config.insert(k.clone(), s);
            }
        }
        Ok(config)
    }

    async fn list_pools(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT poolid FROM mock_hv_pools ORDER BY poolid")
            .fetch_all(&self.db)
            .await
            .map_err(db_err)
    }

    async fn get_pool(&self, poolid: &str) -> Result<PoolInfo> {
        let comment: Option<Option<String>> =
            sqlx::query_scalar("SELECT comment FROM mock_hv_pools WHERE poolid = $1")
                .bind(poolid)
                .fetch_optional(&self.db)
                .await
                .map_err(db_err)?;
        let Some(comment) = comment else {
            return Err(DriverError::vendor(format!("Pool {} doesn't exist", poolid)));
        };
        let members: Vec<i64> =
            sqlx::query_scalar("SELECT vmid FROM mock_hv_vms WHERE pool = $1 ORDER BY vmid")
                .bind(poolid)
                .fetch_all(&self.db)
                .await
                .map_err(db_err)?;
        Ok(PoolInfo {
            poolid: poolid.to_string(),
            comment,
            members,
        })
    }

    async fn next_vmid(&self) -> Result<i64> {
        // Real clusters start user vmids at 100; mirror that.
        sqlx::query_scalar("SELECT COALESCE(MAX(vmid), 99) + 1 FROM mock_hv_vms")
            .fetch_one(&self.db)
            .await
            .map_err(db_err)
    }

    async fn create_pool(&self, poolid: &str, comment: &str) -> Result<()> {
        let res = sqlx::query(
            "INSERT INTO mock_hv_pools (poolid, comment) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(poolid)
        .bind(comment)
        .execute(&self.db)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(DriverError::vendor(format!(
                "Pool {} already exists",
                poolid
            )));
        }
        Ok(())
    }

    async fn delete_pool(&self, poolid: &str) -> Result<()> {
        let res = sqlx::query("DELETE FROM mock_hv_pools WHERE poolid = $1")
            .bind(poolid)
            .execute(&self.db)
            .await
            .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(DriverError::vendor(format!("Pool {} doesn't exist", poolid)));
        }
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
        // Template must exist remotely, like the real guard.
        self.get_vm(node, template).await?;

        let res = sqlx::query(
            r#"
            INSERT INTO mock_hv_vms (vmid, node, name, pool, config)
            VALUES ($1, $2, $3, $4, '{}')
            ON CONFLICT (vmid) DO NOTHING
            "#,
        )
        .bind(newid)
        .bind(node)
        .bind(name)
        .bind(pool)
        .execute(&self.db)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(DriverError::vendor(format!("VM {} already exists", newid)));
        }
        Ok(newid)
    }

    async fn set_ram(&self, node: &str, vmid: i64, max_mb: i64, min_mb: i64) -> Result<()> {
        self.get_vm(node, vmid).await?;
        self.set_config_key(vmid, "memory", &max_mb.to_string())
            .await?;
        self.set_config_key(vmid, "balloon", &min_mb.to_string())
            .await
    }

    async fn set_cores(&self, node: &str, vmid: i64, cores: i32) -> Result<()> {
        self.get_vm(node, vmid).await?;
        self.set_config_key(vmid, "cores", &cores.to_string()).await
    }

    async fn attach_nic(&self, node: &str, vmid: i64, bridge: &str) -> Result<NicAttachment> {
        self.get_vm(node, vmid).await?;
        let bridges = self.list_bridges(node).await?;
        if !bridges.iter().any(|b| b.iface == bridge) {
            return Err(DriverError::vendor(format!(
                "Network {} does not exist",
                bridge
            )));
        }

        let config = self.get_vm_config(node, vmid).await?;
        let slot_index = next_slot(config.keys().map(|k| k.as_str()), "net");
        let slot = format!("net{}", slot_index);
        let mac = random_mac();
        self.set_config_key(
            vmid,
            &slot,
            &format!("model=virtio,bridge={},macaddr={}", bridge, mac),
        )
        .await?;

        Ok(NicAttachment {
            iface: format!("eth{}", slot_index),
            slot,
            mac,
        })
    }

    async fn detach_nic(&self, node: &str, vmid: i64, nic: &str) -> Result<()> {
        let mut config = self.load_config(vmid).await?;
        let _ = node;
        let Some(obj) = config.as_object_mut() else {
            return Err(DriverError::vendor(format!("VM {} has a corrupt config", vmid)));
        };
        if obj.remove(nic).is_none() {
            return Err(DriverError::vendor(format!(
                "VM {} has no nic named {}",
                vmid, nic
            )));
        }
        self.store_config(vmid, config).await
    }

    async fn delete_vm(&self, _node: &str, vmid: i64) -> Result<()> {
        let res = sqlx::query("DELETE FROM mock_hv_vms WHERE vmid = $1")
            .bind(vmid)
            .execute(&self.db)
            .await
            .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(DriverError::vendor(format!("VM {} does not exist", vmid)));
        }
        Ok(())
    }

    async fn set_cloud_init(
        &self,
        node: &str,
        vmid: i64,
        ipconfig: &str,
        password: Option<&str>,
    ) -> Result<()> {
        self.get_vm(node, vmid).await?;
        self.set_config_key(vmid, "ipconfig0", ipconfig).await?;
        if let Some(pwd) = password {
            self.set_config_key(vmid, "cipassword", pwd).await?;
        }
        Ok(())
    }

    async fn attach_cloud_init_drive(&self, node: &str, vmid: i64, storage: &str) -> Result<()> {
        self.get_vm(node, vmid).await?;
        self.set_config_key(vmid, "ide2", &format!("{}:cloudinit", storage))
            .await
    }

    async fn create_volume(
        &self,
        _node: &str,
        storage: &str,
        _vmid: i64,
        name: &str,
        _size_gb: i64,
    ) -> Result<String> {
        Ok(format!("{}:{}", storage, name))
    }

    async fn attach_volume(&self, node: &str, vmid: i64, volid: &str) -> Result<String> {
        self.get_vm(node, vmid).await?;
        let config = self.get_vm_config(node, vmid).await?;
        let slot = format!(
            "scsi{}",
            next_slot(config.keys().map(|k| k.as_str()), "scsi")
        );
        self.set_config_key(vmid, &slot, volid).await?;
        Ok(slot)
    }

    async fn delete_volume(&self, _node: &str, _storage: &str, _volid: &str) -> Result<()> {
        Ok(())
    }
}
