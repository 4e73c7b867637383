//! Account registration
//!
//! Minting a new account means completing the vendor's email-link sign-in:
//! create a disposable address, have Firebase mail it a challenge, pull the
//! OOB code out of the mail, and complete the sign-in for tokens. Identity
//! sources are an ordered strategy list: when the primary mailbox provider
//! fails the verification challenge, the fallback provider is tried next.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::prelude::IndexedRandom;
use tracing::{debug, info, warn};

use warp_auth::{CHALLENGE_SENDER, MailboxClient, random_address_prefix};

/// A fully-registered account ready to enter the pool.
#[derive(Debug, Clone)]
pub struct Registered {
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Seconds until `access_token` expires
    pub expires_in_secs: u64,
}

/// Registration failure, tagged for the replenishment loop's retry logic.
#[derive(Debug, thiserror::Error)]
#[error("{cause}")]
pub struct RegistrationError {
    pub cause: String,
    /// Whether another attempt (or another identity source) may succeed
    pub retryable: bool,
}

impl RegistrationError {
    pub fn retryable(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            retryable: true,
        }
    }

    pub fn fatal(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            retryable: false,
        }
    }
}

/// Seam for the identity-issuance workflow.
///
/// Registration takes seconds (network and challenge-mail latency), so the
/// whole call is bounded by `deadline` and must be run outside any pool
/// lock. Dyn-compatible via `Pin<Box<dyn Future>>` returns.
pub trait Registrar: Send + Sync {
    fn register(
        &self,
        deadline: Duration,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Registered, RegistrationError>> + Send + '_>>;
}

/// One mailbox provider usable as an identity source.
#[derive(Clone)]
pub struct IdentitySource {
    /// Short name for logs ("primary", "fallback")
    pub name: String,
    pub mailbox: MailboxClient,
    /// Domains this provider can receive mail for; one is picked at random
    /// per registration to spread addresses
    pub domains: Vec<String>,
}

/// Registrar running the Warp email-link workflow over a strategy list of
/// identity sources.
pub struct WarpRegistrar {
    client: reqwest::Client,
    api_key: String,
    sources: Vec<IdentitySource>,
    challenge_timeout: Duration,
    poll_interval: Duration,
}

impl WarpRegistrar {
    pub fn new(
        client: reqwest::Client,
        api_key: String,
        sources: Vec<IdentitySource>,
        challenge_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            api_key,
            sources,
            challenge_timeout,
            poll_interval,
        }
    }

    /// Try each identity source in order until one yields an account.
    async fn try_sources(&self) -> Result<Registered, RegistrationError> {
        let mut last = RegistrationError::fatal("no identity sources configured");
        for source in &self.sources {
            match self.register_via(source).await {
                Ok(registered) => {
                    info!(source = %source.name, email = %registered.email, "account registered");
                    return Ok(registered);
                }
                Err(e) if e.retryable => {
                    warn!(source = %source.name, error = %e, "identity source failed, trying next");
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    /// Run the full email-link flow against one identity source.
    async fn register_via(&self, source: &IdentitySource) -> Result<Registered, RegistrationError> {
        let domain = source
            .domains
            .choose(&mut rand::rng())
            .ok_or_else(|| RegistrationError::fatal(format!("source {} has no domains", source.name)))?;

        let email = source
            .mailbox
            .create_address(&random_address_prefix(), domain)
            .await
            .map_err(|e| RegistrationError::retryable(format!("mailbox address: {e}")))?;
        debug!(source = %source.name, email, "registration address created");

        // A provider-side rejection here is independent of the mailbox, so
        // switching sources won't help
        warp_auth::send_signin_link(&self.client, &self.api_key, &email)
            .await
            .map_err(|e| match e {
                warp_auth::Error::Provider(msg) => {
                    RegistrationError::fatal(format!("sendOobCode: {msg}"))
                }
                other => RegistrationError::retryable(format!("sendOobCode: {other}")),
            })?;

        let mail = source
            .mailbox
            .wait_for_message(&email, CHALLENGE_SENDER, self.challenge_timeout, self.poll_interval)
            .await
            .map_err(|e| RegistrationError::retryable(format!("challenge mail: {e}")))?;

        let oob_code = warp_auth::extract_oob_code(&mail.content)
            .ok_or_else(|| RegistrationError::retryable("challenge mail carried no OOB code"))?;

        let tokens = warp_auth::complete_signin(&self.client, &self.api_key, &email, &oob_code)
            .await
            .map_err(|e| RegistrationError::retryable(format!("completing sign-in: {e}")))?;

        // The id token from email-link sign-in is the initial access token;
        // Firebase id tokens live one hour
        Ok(Registered {
            email,
            access_token: tokens.id_token,
            refresh_token: tokens.refresh_token,
            expires_in_secs: 3_600,
        })
    }
}

impl Registrar for WarpRegistrar {
    fn register(
        &self,
        deadline: Duration,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<Registered, RegistrationError>> + Send + '_>>
    {
        Box::pin(async move {
            match tokio::time::timeout(deadline, self.try_sources()).await {
                Ok(result) => result,
                Err(_) => Err(RegistrationError::retryable(format!(
                    "registration deadline of {deadline:?} elapsed"
                ))),
            }
        })
    }
}
