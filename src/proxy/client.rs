//! HTTP client for the fault proxy's management API

use super::{ProxyBinding, Toxic, ToxicRecord};
use crate::error::{HarnessError, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ToxiproxyClient {
    base_url: String,
    client: reqwest::Client,
}

impl ToxiproxyClient {
    /// `address` is `host:port` of the management API
    pub fn new(address: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            base_url: format!("http://{}", address),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(HarnessError::InfrastructureUnavailable(format!(
            "Proxy API {} failed ({}): {}",
            what, status, body
        )))
    }

    pub async fn version(&self) -> Result<String> {
        let url = format!("{}/version", self.base_url);
        let response = Self::check(self.client.get(&url).send().await?, "version").await?;
        Ok(response.text().await?.trim().to_string())
    }

    /// Create a binding; an existing binding with the same name is updated
    pub async fn create_proxy(&self, binding: &ProxyBinding) -> Result<()> {
        let url = format!("{}/proxies", self.base_url);
        let body = json!({
            "name": binding.name,
            "listen": binding.listen,
            "upstream": binding.upstream,
            "enabled": true,
        });
        let response = self.client.post(&url).json(&body).send().await?;
        if response.status().as_u16() == 409 {
            let url = format!("{}/proxies/{}", self.base_url, binding.name);
            let update = json!({ "listen": binding.listen, "upstream": binding.upstream, "enabled": true });
            Self::check(self.client.post(&url).json(&update).send().await?, "update proxy").await?;
            return Ok(());
        }
        Self::check(response, "create proxy").await?;
        Ok(())
    }

    pub async fn list_proxies(&self) -> Result<BTreeMap<String, ProxyBinding>> {
        let url = format!("{}/proxies", self.base_url);
        let response = Self::check(self.client.get(&url).send().await?, "list proxies").await?;
        Ok(response.json().await?)
    }

    pub async fn set_enabled(&self, proxy: &str, enabled: bool) -> Result<()> {
        let url = format!("{}/proxies/{}", self.base_url, proxy);
        let body = json!({ "enabled": enabled });
        Self::check(self.client.post(&url).json(&body).send().await?, "toggle proxy").await?;
        Ok(())
    }

    pub async fn add_toxic(&self, proxy: &str, toxic: &Toxic) -> Result<()> {
        let url = format!("{}/proxies/{}/toxics", self.base_url, proxy);
        let record = toxic.to_record();
        Self::check(self.client.post(&url).json(&record).send().await?, "add toxic").await?;
        tracing::debug!(proxy, toxic = %record.name, "toxic added");
        Ok(())
    }

    pub async fn list_toxics(&self, proxy: &str) -> Result<Vec<ToxicRecord>> {
        let url = format!("{}/proxies/{}/toxics", self.base_url, proxy);
        let response = Self::check(self.client.get(&url).send().await?, "list toxics").await?;
        Ok(response.json().await?)
    }

    pub async fn remove_toxic(&self, proxy: &str, toxic: &str) -> Result<()> {
        let url = format!("{}/proxies/{}/toxics/{}", self.base_url, proxy, toxic);
        let response = self.client.delete(&url).send().await?;
        // Already gone is fine
        if response.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check(response, "remove toxic").await?;
        Ok(())
    }

    /// Remove every toxic on `proxy`, returning how many were removed
    pub async fn remove_all_toxics(&self, proxy: &str) -> Result<usize> {
        let toxics = self.list_toxics(proxy).await?;
        for toxic in &toxics {
            self.remove_toxic(proxy, &toxic.name).await?;
        }
        Ok(toxics.len())
    }
}
