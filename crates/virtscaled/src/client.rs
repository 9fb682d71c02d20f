//! HTTP client for the control API, used by the CLI subcommands.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

use virtscale_fleet::FleetSnapshot;

use crate::api::{ErrorBody, ScaleRequest};

pub struct ControlClient {
    base: String,
    http: reqwest::Client,
}

impl ControlClient {
    pub fn new(listen: SocketAddr) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base: format!("http://{listen}"),
            http,
        })
    }

    /// Set the desired replica count on the running daemon.
    pub async fn scale(&self, count: u32) -> anyhow::Result<()> {
        let resp = self
            .http
            .post(format!("{}/v1/scale", self.base))
            .json(&ScaleRequest {
                count: i64::from(count),
            })
            .send()
            .await
            .with_context(|| format!("cannot reach daemon at {} (is it running?)", self.base))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let detail = resp
                .json::<ErrorBody>()
                .await
                .map(|b| b.error)
                .unwrap_or_else(|_| "no detail".to_string());
            anyhow::bail!("daemon rejected scale request ({status}): {detail}");
        }
        Ok(())
    }

    /// Fetch the current fleet snapshot.
    pub async fn state(&self) -> anyhow::Result<FleetSnapshot> {
        let resp = self
            .http
            .get(format!("{}/v1/state", self.base))
            .send()
            .await
            .with_context(|| format!("cannot reach daemon at {} (is it running?)", self.base))?;

        resp.error_for_status()
            .context("state request failed")?
            .json::<FleetSnapshot>()
            .await
            .context("malformed state response")
    }
}
