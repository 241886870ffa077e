use std::collections::BTreeMap;

use anyhow::Context;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;

/// One brokered forward: the remote hosts to tunnel to, the PSK shared
/// secret securing those legs, and the service credentials to hand the user.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwardDataSet {
    pub id: i64,
    #[serde(rename = "public_uris", default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub shared_secret: String,
    #[serde(default)]
    pub credentials: ForwardCredentials,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForwardCredentials {
    #[serde(default)]
    pub credentials: serde_json::Map<String, serde_json::Value>,
}

impl ForwardDataSet {
    /// Flatten the free-form credentials payload into printable string
    /// pairs. Strings and numbers are kept; nested structures are dropped.
    pub fn credentials_map(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (key, value) in &self.credentials.credentials {
            match value {
                serde_json::Value::String(s) => {
                    out.insert(key.clone(), s.clone());
                }
                serde_json::Value::Number(n) => {
                    out.insert(key.clone(), n.to_string());
                }
                _ => {}
            }
        }
        out
    }
}

/// Client for the service-forward control-plane API.
#[derive(Debug)]
pub struct Client {
    base: String,
    token: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(endpoint: &str, token: &str, insecure_skip_verify: bool) -> anyhow::Result<Self> {
        let base = endpoint.trim().trim_end_matches('/').to_string();
        if base.is_empty() {
            anyhow::bail!("api: empty endpoint (set one with `jumper target <url>`)");
        }

        let mut builder = reqwest::Client::builder();
        if insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            base,
            token: token.to_string(),
            http: builder.build().context("api: build http client")?,
        })
    }

    pub async fn create_forward(&self, service: &str) -> anyhow::Result<ForwardDataSet> {
        let url = format!("{}/services/{service}/forwards", self.base);
        let body = self.request(self.http.post(&url), &url).await?;
        serde_json::from_str(&body).with_context(|| format!("api: decode forward from {url}"))
    }

    /// Returns the raw response body; the server reports the deletion result
    /// as plain text.
    pub async fn delete_forward(&self, service: &str, connection_id: &str) -> anyhow::Result<String> {
        let url = format!("{}/services/{service}/forwards/{connection_id}", self.base);
        self.request(self.http.delete(&url), &url).await
    }

    pub async fn list_forwards(&self, service: &str) -> anyhow::Result<Vec<ForwardDataSet>> {
        let url = format!("{}/services/{service}/forwards/", self.base);
        let body = self.request(self.http.get(&url), &url).await?;
        serde_json::from_str(&body).with_context(|| format!("api: decode forwards from {url}"))
    }

    async fn request(&self, req: reqwest::RequestBuilder, url: &str) -> anyhow::Result<String> {
        let resp = req
            .header(AUTHORIZATION, self.token.as_str())
            .send()
            .await
            .with_context(|| format!("api: request {url}"))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .with_context(|| format!("api: read response from {url}"))?;

        if !status.is_success() {
            anyhow::bail!("api: {url} returned {status}:\n{body}");
        }
        Ok(body)
    }
}
