//! Warp identity and token library
//!
//! Implements the external identity workflow the account pool depends on:
//! Firebase email-link sign-in (send challenge, complete with OOB code),
//! token refresh against the Warp token proxy, and the temporary-mailbox
//! HTTP API used to receive challenge mails. This crate is a standalone
//! library with no dependency on the pool or the service binary.
//!
//! Registration flow:
//! 1. `mailbox::MailboxClient::create_address()` — mint a disposable address
//! 2. `signin::send_signin_link()` — Firebase sends the challenge mail
//! 3. `mailbox::MailboxClient::wait_for_message()` — poll until it arrives
//! 4. `signin::extract_oob_code()` — pull the OOB code out of the mail body
//! 5. `signin::complete_signin()` — exchange the code for id/refresh tokens
//! 6. `token::refresh_id_token()` — later renewals via the refresh token

pub mod constants;
pub mod error;
pub mod mailbox;
pub mod signin;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use mailbox::{MailMessage, MailboxClient, random_address_prefix};
pub use signin::{SignInTokens, complete_signin, extract_oob_code, send_signin_link};
pub use token::{TokenResponse, refresh_id_token};
