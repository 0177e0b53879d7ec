// SPDX-License-Identifier: MIT
//! Delivery of finished accounting records to the remote aggregator.

use log::{error, info};
use serde::Serialize;
use std::time::Duration;

use crate::config::AccountingConfig;
use crate::error::{BdockerError, Result};

/// Receives finished accounting records.
pub trait AccountingNotifier: Send + Sync {
    fn notify_accounting(&self, admin_token: &str, record: &str) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct AccountingPayload<'a> {
    admin_token: &'a str,
    accounting: &'a str,
}

/// POSTs `{admin_token, accounting}` to the configured endpoint.
pub struct HttpAccountingNotifier {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpAccountingNotifier {
    pub fn new(config: &AccountingConfig) -> Result<Self> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            BdockerError::Configuration("accounting.endpoint is not configured".to_string())
        })?;

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| {
                BdockerError::Configuration(format!("Failed to build accounting client: {}", e))
            })?;

        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl AccountingNotifier for HttpAccountingNotifier {
    fn notify_accounting(&self, admin_token: &str, record: &str) -> Result<()> {
        let payload = AccountingPayload {
            admin_token,
            accounting: record,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .map_err(|e| {
                error!("endpoint={} Accounting delivery failed: {}", self.endpoint, e);
                BdockerError::Internal(format!(
                    "Failed to reach accounting endpoint {}: {}",
                    self.endpoint, e
                ))
            })?;

        let status = response.status();
        if status.is_success() {
            info!("endpoint={} status={} Accounting record delivered", self.endpoint, status);
            return Ok(());
        }

        let body = response.text().unwrap_or_default();
        error!(
            "endpoint={} status={} Accounting record rejected",
            self.endpoint, status
        );
        Err(BdockerError::from_remote(status.as_u16(), &body))
    }
}
