//! Token refresh against the Warp token proxy
//!
//! POSTs `grant_type=refresh_token` form data with the client identification
//! headers the proxy expects. The proxy fronts Firebase's secure-token
//! service, which reports `expires_in` as a decimal string, so the response
//! type accepts both string and integer forms.

use serde::{Deserialize, Deserializer};

use crate::constants::{CLIENT_VERSION, OS_CATEGORY, OS_NAME, OS_VERSION, TOKEN_ENDPOINT};
use crate::error::{Error, Result};

/// Response from the token proxy for a refresh.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts this to an absolute unix millisecond timestamp when storing
/// the account. Refresh tokens may rotate; when the proxy omits the field
/// the previous refresh token remains valid.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(deserialize_with = "u64_or_string")]
    pub expires_in: u64,
}

/// Firebase reports `expires_in` as `"3600"`; accept a bare number too.
fn u64_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Refresh an access token using a refresh token.
///
/// Called by the background refresh loop and by allocation-time lazy
/// refresh when a selected account's token has already expired.
pub async fn refresh_id_token(
    client: &reqwest::Client,
    api_key: &str,
    refresh: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(format!("{TOKEN_ENDPOINT}?key={api_key}"))
        .header("x-warp-client-version", CLIENT_VERSION)
        .header("x-warp-os-category", OS_CATEGORY)
        .header("x-warp-os-name", OS_NAME)
        .header("x-warp-os-version", OS_VERSION)
        .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh)])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        // 400/401/403 from the secure-token service mean the refresh token
        // is revoked, expired, or malformed
        if matches!(status.as_u16(), 400 | 401 | 403) {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::Provider(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::Parse(format!("invalid refresh response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_response_deserializes_numeric_expiry() {
        let json = r#"{"access_token":"at_abc","refresh_token":"rt_def","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at_abc");
        assert_eq!(token.refresh_token.as_deref(), Some("rt_def"));
        assert_eq!(token.expires_in, 3600);
    }

    #[test]
    fn token_response_deserializes_string_expiry() {
        // Firebase secure-token responses quote the number
        let json = r#"{"access_token":"at_abc","expires_in":"3600"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.expires_in, 3600);
        assert!(token.refresh_token.is_none());
    }

    #[test]
    fn token_response_rejects_garbage_expiry() {
        let json = r#"{"access_token":"at_abc","expires_in":"soon"}"#;
        assert!(serde_json::from_str::<TokenResponse>(json).is_err());
    }

    #[test]
    fn token_endpoint_is_the_warp_proxy() {
        assert_eq!(TOKEN_ENDPOINT, "https://app.warp.dev/proxy/token");
    }

    #[test]
    fn refresh_request_url_carries_api_key() {
        // The proxy takes the key as a URL parameter, not a header
        let request = reqwest::Client::new()
            .post(format!("{TOKEN_ENDPOINT}?key=k_123"))
            .build()
            .unwrap();
        assert_eq!(request.url().query(), Some("key=k_123"));
    }
}
