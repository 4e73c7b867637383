//! Temporary-mailbox HTTP client
//!
//! Talks to a moemail-style mailbox service: `addUser` mints a disposable
//! address, `emailList` pages its inbox. The pool's registrar uses this to
//! receive Firebase sign-in challenge mails. Two instances with different
//! base URLs serve as the primary and fallback identity sources.

use std::time::Duration;

use rand::RngExt;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

/// One message from the mailbox inbox.
#[derive(Debug, Clone, Deserialize)]
pub struct MailMessage {
    #[serde(rename = "uuid")]
    pub id: String,
    #[serde(rename = "sendEmail", default)]
    pub from_address: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: u16,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

/// Client for one mailbox provider.
#[derive(Clone)]
pub struct MailboxClient {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
}

impl MailboxClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
        }
    }

    /// Mint a disposable address `prefix@domain` on this provider.
    pub async fn create_address(&self, prefix: &str, domain: &str) -> Result<String> {
        let address = format!("{prefix}@{domain}");
        let response = self
            .client
            .post(format!("{}/api/public/addUser", self.base_url))
            .header("Authorization", &self.api_token)
            .json(&serde_json::json!({ "list": [{ "email": address }] }))
            .send()
            .await
            .map_err(|e| Error::Http(format!("addUser request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::Mailbox(format!("addUser returned {status}: {body}")));
        }

        let envelope: ApiEnvelope<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("invalid addUser response: {e}")))?;
        if envelope.code != 200 {
            return Err(Error::Mailbox(format!(
                "addUser rejected: {}",
                envelope.message
            )));
        }

        debug!(address, "disposable address created");
        Ok(address)
    }

    /// List inbox messages for `to_email`, optionally filtered by sender.
    pub async fn list_messages(
        &self,
        to_email: &str,
        from_address: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MailMessage>> {
        let mut body = serde_json::json!({
            "num": 1,
            "size": limit,
            "toEmail": to_email,
        });
        if let Some(sender) = from_address {
            body["sendEmail"] = serde_json::Value::String(sender.to_string());
        }

        let response = self
            .client
            .post(format!("{}/api/public/emailList", self.base_url))
            .header("Authorization", &self.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("emailList request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            return Err(Error::Mailbox(format!(
                "emailList returned {status}: {body}"
            )));
        }

        let envelope: ApiEnvelope<Vec<MailMessage>> = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("invalid emailList response: {e}")))?;
        if envelope.code != 200 {
            return Err(Error::Mailbox(format!(
                "emailList rejected: {}",
                envelope.message
            )));
        }

        Ok(envelope.data.unwrap_or_default())
    }

    /// Poll the inbox until a message from `sender` arrives.
    ///
    /// Polls every `poll_interval` up to `timeout`, then fails with
    /// `ChallengeTimeout`. Transient list errors are logged and retried on
    /// the next poll rather than aborting the wait.
    pub async fn wait_for_message(
        &self,
        to_email: &str,
        sender: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<MailMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.list_messages(to_email, Some(sender), 10).await {
                Ok(messages) => {
                    if let Some(msg) = messages
                        .into_iter()
                        .find(|m| m.from_address.eq_ignore_ascii_case(sender) || m.from_address.is_empty())
                    {
                        debug!(to_email, subject = %msg.subject, "challenge mail received");
                        return Ok(msg);
                    }
                }
                Err(e) => {
                    debug!(to_email, error = %e, "inbox poll failed, retrying");
                }
            }

            if tokio::time::Instant::now() + poll_interval > deadline {
                return Err(Error::ChallengeTimeout(timeout.as_secs()));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Random lowercase alphanumeric prefix for a disposable address.
pub fn random_address_prefix() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    // Leading letter: some mailbox providers reject digit-first local parts
    let mut prefix = String::with_capacity(12);
    prefix.push(CHARSET[rng.random_range(0..26)] as char);
    for _ in 0..11 {
        prefix.push(CHARSET[rng.random_range(0..CHARSET.len())] as char);
    }
    prefix
}
