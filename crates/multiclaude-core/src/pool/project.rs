//! Google Cloud project discovery for Antigravity accounts.

use super::AccountPool;
use multiclaude_types::{Account, ProxyError};
use serde_json::{json, Value};

/// Known-good fallback project when discovery yields nothing.
const DEFAULT_PROJECT_ID: &str = "bamboo-precept-lgxtn";

impl AccountPool {
    /// Resolve the Cloud project for an account. The stored id wins;
    /// otherwise loadCodeAssist is consulted across the endpoint list and
    /// the result is cached per email.
    pub async fn get_project(&self, account: &Account, token: &str) -> Result<String, ProxyError> {
        if let Some(pid) = &account.project_id {
            return Ok(pid.clone());
        }
        if let Some(cached) = self.projects.get(&account.email) {
            return Ok(cached.clone());
        }

        let body = json!({ "metadata": { "ideType": "ANTIGRAVITY" } });
        let mut last_err: Option<String> = None;

        for base in crate::upstream::base_urls() {
            let url = format!("{}:loadCodeAssist", base);
            let response = match self
                .http
                .post(&url)
                .bearer_auth(token)
                .header("User-Agent", crate::upstream::USER_AGENT)
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_err = Some(format!("loadCodeAssist at {} failed: {}", base, e));
                    continue;
                }
            };

            if !response.status().is_success() {
                last_err = Some(format!("loadCodeAssist returned {}", response.status()));
                continue;
            }

            let data: Value = match response.json().await {
                Ok(v) => v,
                Err(e) => {
                    last_err = Some(format!("loadCodeAssist parse error: {}", e));
                    continue;
                }
            };

            let pid = data
                .get("cloudaicompanionProject")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_PROJECT_ID)
                .to_string();
            self.projects.insert(account.email.clone(), pid.clone());
            return Ok(pid);
        }

        tracing::warn!(
            "Project discovery failed for {} ({}), using default project",
            account.email,
            last_err.unwrap_or_else(|| "no endpoints".to_string())
        );
        self.projects.insert(account.email.clone(), DEFAULT_PROJECT_ID.to_string());
        Ok(DEFAULT_PROJECT_ID.to_string())
    }
}
