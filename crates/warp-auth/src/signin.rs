//! Firebase email-link sign-in
//!
//! The registration workflow has no password step: Firebase mails a sign-in
//! link containing an OOB code to the chosen address, and completing the
//! sign-in with that code yields the account's id and refresh tokens.

use serde::Deserialize;
use tracing::debug;

use crate::constants::{CONTINUE_URL, SEND_OOB_ENDPOINT, SIGN_IN_ENDPOINT};
use crate::error::{Error, Result};

/// Tokens obtained by completing an email-link sign-in.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInTokens {
    pub id_token: String,
    pub refresh_token: String,
    /// Firebase-assigned stable user id
    pub local_id: String,
}

/// Ask Firebase to mail a sign-in challenge to `email`.
pub async fn send_signin_link(client: &reqwest::Client, api_key: &str, email: &str) -> Result<()> {
    let response = client
        .post(format!("{SEND_OOB_ENDPOINT}?key={api_key}"))
        .json(&serde_json::json!({
            "requestType": "EMAIL_SIGNIN",
            "email": email,
            "clientType": "CLIENT_TYPE_WEB",
            "continueUrl": CONTINUE_URL,
            "canHandleCodeInApp": true,
        }))
        .send()
        .await
        .map_err(|e| Error::Http(format!("sendOobCode request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::Provider(format!(
            "sendOobCode returned {status}: {body}"
        )));
    }

    debug!(email, "sign-in challenge sent");
    Ok(())
}

/// Complete the sign-in with the OOB code extracted from the challenge mail.
pub async fn complete_signin(
    client: &reqwest::Client,
    api_key: &str,
    email: &str,
    oob_code: &str,
) -> Result<SignInTokens> {
    let response = client
        .post(format!("{SIGN_IN_ENDPOINT}?key={api_key}"))
        .json(&serde_json::json!({
            "email": email,
            "oobCode": oob_code,
        }))
        .send()
        .await
        .map_err(|e| Error::Http(format!("signInWithEmailLink request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        // An expired or already-used OOB code comes back as 400
        if status.as_u16() == 400 {
            return Err(Error::InvalidCredentials(format!(
                "OOB code rejected: {body}"
            )));
        }
        return Err(Error::Provider(format!(
            "signInWithEmailLink returned {status}: {body}"
        )));
    }

    response
        .json::<SignInTokens>()
        .await
        .map_err(|e| Error::Parse(format!("invalid sign-in response: {e}")))
}

/// Extract the `oobCode` parameter from a challenge mail body.
///
/// The mail is HTML with the code embedded in the sign-in link, often with
/// `&` entity-encoded as `&amp;`. Returns `None` when no code is present
/// (a failed verification challenge).
pub fn extract_oob_code(body: &str) -> Option<String> {
    let decoded = body.replace("&amp;", "&");
    let start = decoded.find("oobCode=")? + "oobCode=".len();
    let rest = &decoded[start..];
    let end = rest
        .find(|c: char| matches!(c, '&' | '"' | '\'' | '<' | '>') || c.is_whitespace())
        .unwrap_or(rest.len());
    let code = &rest[..end];
    if code.is_empty() {
        None
    } else {
        Some(code.to_string())
    }
}
