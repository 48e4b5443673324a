use anyhow::{bail, Context};

/// Simple JSON-RPC 2.0 client used by the miner to talk to a running node.
///
/// Uses raw HTTP POST with serde_json rather than the full jsonrpsee client
/// to keep the miner binary lean and dependency-minimal.
pub struct MinerRpcClient {
    url: String,
    client: reqwest::Client,
}

impl MinerRpcClient {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Call a JSON-RPC method and return the `result` field.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("connecting to node at {}", self.url))?;

        let json: serde_json::Value = resp.json().await.context("parsing RPC response")?;

        if let Some(err) = json.get("error") {
            bail!("RPC error: {}", err);
        }

        Ok(json["result"].clone())
    }

    pub async fn register_user(
        &self,
        user_id: &str,
        referred_by: Option<&str>,
    ) -> anyhow::Result<()> {
        self.call(
            "oreline_registerUser",
            serde_json::json!([user_id, referred_by]),
        )
        .await?;
        Ok(())
    }

    /// Start a session; returns the session id hex.
    pub async fn start_mining(
        &self,
        user_id: &str,
        hash_power: u32,
        fingerprint: &str,
    ) -> anyhow::Result<String> {
        let result = self
            .call(
                "oreline_startMining",
                serde_json::json!([user_id, hash_power, null, fingerprint]),
            )
            .await?;
        let session_id = result["session_id"]
            .as_str()
            .context("missing session_id in start response")?;
        Ok(session_id.to_string())
    }

    /// One heartbeat. Returns `(elapsed_seconds, total_grains)` — the
    /// server's authoritative figures, which the caller must adopt.
    pub async fn heartbeat(&self, session_id: &str) -> anyhow::Result<(i64, u128)> {
        let result = self
            .call("oreline_heartbeat", serde_json::json!([session_id]))
            .await?;
        let elapsed = result["elapsed_seconds"]
            .as_i64()
            .context("missing elapsed_seconds in heartbeat response")?;
        let total: u128 = result["total_grains"]
            .as_str()
            .context("missing total_grains in heartbeat response")?
            .parse()
            .context("parsing total_grains")?;
        Ok((elapsed, total))
    }

    /// Stop a session. Returns `(status, total_seconds, total_grains)`.
    pub async fn stop_mining(&self, session_id: &str) -> anyhow::Result<(String, i64, u128)> {
        let result = self
            .call("oreline_stopMining", serde_json::json!([session_id]))
            .await?;
        let status = result["status"]
            .as_str()
            .context("missing status in stop response")?
            .to_string();
        let seconds = result["total_seconds"]
            .as_i64()
            .context("missing total_seconds in stop response")?;
        let total: u128 = result["total_grains"]
            .as_str()
            .context("missing total_grains in stop response")?
            .parse()
            .context("parsing total_grains")?;
        Ok((status, seconds, total))
    }

    /// The user's active session id, if any.
    pub async fn get_active_session(&self, user_id: &str) -> anyhow::Result<Option<String>> {
        let result = self
            .call("oreline_getSession", serde_json::json!([user_id]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let session_id = result["session_id"]
            .as_str()
            .context("missing session_id in session response")?;
        Ok(Some(session_id.to_string()))
    }

    /// Available balance in Grains.
    pub async fn get_balance(&self, user_id: &str) -> anyhow::Result<u128> {
        let result = self
            .call("oreline_getBalance", serde_json::json!([user_id]))
            .await?;
        let bal: u128 = result["available_grains"]
            .as_str()
            .context("expected string balance")?
            .parse()
            .context("parsing balance")?;
        Ok(bal)
    }

    pub async fn get_ledger(
        &self,
        user_id: &str,
        limit: u32,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let result = self
            .call("oreline_getLedger", serde_json::json!([user_id, limit]))
            .await?;
        result
            .as_array()
            .cloned()
            .context("expected ledger entry array")
    }

    pub async fn get_referral_stats(&self, user_id: &str) -> anyhow::Result<serde_json::Value> {
        self.call("oreline_getReferralStats", serde_json::json!([user_id]))
            .await
    }

    pub async fn get_engine_info(&self) -> anyhow::Result<serde_json::Value> {
        self.call("oreline_getEngineInfo", serde_json::json!([]))
            .await
    }
}
