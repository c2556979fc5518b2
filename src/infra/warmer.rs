//! Cache warming over HTTP.
//!
//! Each candidate URL is fetched with `Cache-Prime: 1`; the host renders it
//! and the capture layer stores the snapshot as a side effect.

use std::time::{Duration, Instant};

use futures::{StreamExt, stream};
use reqwest::Client;
use tracing::{info, warn};

use super::error::InfraError;

const TARGET: &str = "infra::warmer";
pub const CACHE_PRIME_HEADER: &str = "Cache-Prime";
const WARM_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmReport {
    pub requested: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct CacheWarmer {
    client: Client,
}

impl CacheWarmer {
    pub fn new(timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn user_agent() -> &'static str {
        concat!("snapcache-warmer/", env!("CARGO_PKG_VERSION"))
    }

    /// Request every URL; individual failures are logged and counted.
    pub async fn warm(&self, urls: &[String]) -> WarmReport {
        let started_at = Instant::now();
        let outcomes: Vec<bool> = stream::iter(urls)
            .map(|url| self.prime(url))
            .buffer_unordered(WARM_CONCURRENCY)
            .collect()
            .await;

        let succeeded = outcomes.iter().filter(|ok| **ok).count();
        let report = WarmReport {
            requested: urls.len(),
            succeeded,
            failed: urls.len() - succeeded,
        };
        info!(
            target = TARGET,
            op = "warm",
            result = if report.failed == 0 { "ok" } else { "partial" },
            requested = report.requested,
            failed = report.failed,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Warmup done"
        );
        report
    }

    async fn prime(&self, url: &str) -> bool {
        let response = self
            .client
            .get(url)
            .header(CACHE_PRIME_HEADER, "1")
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                info!(
                    target = TARGET,
                    op = "prime",
                    result = "ok",
                    url,
                    status = response.status().as_u16(),
                    "Rendered"
                );
                true
            }
            Ok(response) => {
                warn!(
                    target = TARGET,
                    op = "prime",
                    result = "status",
                    url,
                    status = response.status().as_u16(),
                    "Warm request returned a non-success status"
                );
                false
            }
            Err(err) => {
                warn!(
                    target = TARGET,
                    op = "prime",
                    result = "error",
                    url,
                    error = %err,
                    "Warm request failed"
                );
                false
            }
        }
    }
}
