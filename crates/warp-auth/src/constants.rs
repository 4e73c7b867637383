//! Endpoints and client identification constants
//!
//! The token endpoint is Warp's proxy in front of the Firebase secure-token
//! service; sign-in challenges go to the Firebase identity toolkit directly.
//! Both take the API key as a query parameter.

/// Warp token proxy — exchanges refresh tokens for fresh access tokens.
pub const TOKEN_ENDPOINT: &str = "https://app.warp.dev/proxy/token";

/// Firebase identity toolkit: send an email sign-in challenge.
pub const SEND_OOB_ENDPOINT: &str =
    "https://identitytoolkit.googleapis.com/v1/accounts:sendOobCode";

/// Firebase identity toolkit: complete email-link sign-in with an OOB code.
pub const SIGN_IN_ENDPOINT: &str =
    "https://identitytoolkit.googleapis.com/v1/accounts:signInWithEmailLink";

/// Landing URL embedded in the sign-in challenge mail.
pub const CONTINUE_URL: &str = "https://app.warp.dev/login";

/// Sender address of the sign-in challenge mail; used to filter the mailbox.
pub const CHALLENGE_SENDER: &str = "noreply@auth.app.warp.dev";

/// Client identification headers the token proxy expects.
pub const CLIENT_VERSION: &str = "v0.2025.08.06.08.12.stable_02";
pub const OS_CATEGORY: &str = "Darwin";
pub const OS_NAME: &str = "macOS";
pub const OS_VERSION: &str = "14.0";
