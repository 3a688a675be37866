use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// 外链可达性检查
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LinkChecker: Send + Sync {
    async fn is_reachable(&self, url: &str) -> bool;
}

/// 发一个 GET 请求，只有 200 算可达
#[derive(Clone)]
pub struct HttpLinkChecker {
    client: Client,
}

impl HttpLinkChecker {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build http client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl LinkChecker for HttpLinkChecker {
    async fn is_reachable(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => {
                debug!("Link {} answered {}", url, response.status());
                response.status() == StatusCode::OK
            }
            Err(e) => {
                warn!("Link {} is unreachable: {}", url, e);
                false
            }
        }
    }
}
