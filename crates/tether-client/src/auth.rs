//! SSH user authentication.
//!
//! Password authentication falls back to keyboard-interactive when the server
//! rejects the plain password request; every interactive prompt is answered
//! with the same password. Key authentication decodes an in-memory
//! OpenSSH/PEM private key and never touches the filesystem.

use std::sync::Arc;

use russh::client::{Handle, Handler, KeyboardInteractiveAuthResponse};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use tether_core::{AuthMethod, Credentials, TetherError, TetherResult};

/// Upper bound on keyboard-interactive rounds before giving up.
const MAX_INTERACTIVE_ROUNDS: usize = 8;

/// Answers keyboard-interactive prompts on behalf of the user.
///
/// One responder is created per authentication attempt and owns its own copy
/// of the password, so concurrent attempts never share state.
pub struct PasswordResponder {
    password: String,
}

impl PasswordResponder {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }

    /// One answer per prompt, each the configured password.
    pub fn answers(&self, prompt_count: usize) -> Vec<String> {
        vec![self.password.clone(); prompt_count]
    }
}

impl std::fmt::Debug for PasswordResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordResponder").finish_non_exhaustive()
    }
}

/// Authenticate `username` on an established handshake.
///
/// Any rejection is reported as [`TetherError::AuthenticationFailed`].
pub async fn authenticate<H: Handler>(
    handle: &mut Handle<H>,
    username: &str,
    method: AuthMethod,
    credentials: &Credentials,
) -> TetherResult<()> {
    let accepted = match method {
        AuthMethod::Password => {
            let password = credentials
                .password
                .as_deref()
                .ok_or(TetherError::AuthenticationFailed)?;
            authenticate_password(handle, username, password).await?
        }
        AuthMethod::Key | AuthMethod::KeyWithPassphrase => {
            let key = load_private_key(credentials)?;
            authenticate_key(handle, username, key).await?
        }
    };

    if accepted {
        tracing::info!("authenticated as {} ({:?})", username, method);
        Ok(())
    } else {
        tracing::warn!("authentication rejected for {}", username);
        Err(TetherError::AuthenticationFailed)
    }
}

async fn authenticate_password<H: Handler>(
    handle: &mut Handle<H>,
    username: &str,
    password: &str,
) -> TetherResult<bool> {
    let result = handle
        .authenticate_password(username, password)
        .await
        .map_err(auth_error)?;
    if result.success() {
        return Ok(true);
    }

    tracing::debug!("password rejected, trying keyboard-interactive");
    let responder = PasswordResponder::new(password);
    keyboard_interactive(handle, username, &responder).await
}

async fn keyboard_interactive<H: Handler>(
    handle: &mut Handle<H>,
    username: &str,
    responder: &PasswordResponder,
) -> TetherResult<bool> {
    let mut response = handle
        .authenticate_keyboard_interactive_start(username, None::<String>)
        .await
        .map_err(auth_error)?;

    for _ in 0..MAX_INTERACTIVE_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                tracing::debug!("answering {} interactive prompt(s)", prompts.len());
                response = handle
                    .authenticate_keyboard_interactive_respond(responder.answers(prompts.len()))
                    .await
                    .map_err(auth_error)?;
            }
            _ => return Ok(false),
        }
    }
    Ok(false)
}

async fn authenticate_key<H: Handler>(
    handle: &mut Handle<H>,
    username: &str,
    key: PrivateKey,
) -> TetherResult<bool> {
    let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
    let result = handle
        .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await
        .map_err(auth_error)?;
    Ok(result.success())
}

/// Decode the private key held in `credentials`.
///
/// When a public key is supplied it must belong to the private key.
pub fn load_private_key(credentials: &Credentials) -> TetherResult<PrivateKey> {
    let pem = credentials
        .private_key
        .as_deref()
        .ok_or(TetherError::AuthenticationFailed)?;
    let pem = std::str::from_utf8(pem).map_err(|_| {
        tracing::warn!("private key is not valid UTF-8");
        TetherError::AuthenticationFailed
    })?;

    let key = russh::keys::decode_secret_key(pem, credentials.passphrase.as_deref()).map_err(|e| {
        tracing::warn!("failed to decode private key: {}", e);
        TetherError::AuthenticationFailed
    })?;

    if let Some(public) = credentials.public_key.as_deref() {
        let public = String::from_utf8_lossy(public);
        let public = PublicKey::from_openssh(public.trim()).map_err(|e| {
            tracing::warn!("failed to parse public key: {}", e);
            TetherError::AuthenticationFailed
        })?;
        if public.key_data() != key.public_key().key_data() {
            tracing::warn!("public key does not match private key");
            return Err(TetherError::AuthenticationFailed);
        }
    }

    Ok(key)
}

/// Whether an encoded private key is protected by a passphrase.
pub fn requires_passphrase(private_key: &[u8]) -> bool {
    let Ok(pem) = std::str::from_utf8(private_key) else {
        return false;
    };
    matches!(
        russh::keys::decode_secret_key(pem, None),
        Err(russh::keys::Error::KeyIsEncrypted)
    )
}

fn auth_error(e: russh::Error) -> TetherError {
    tracing::debug!("authentication transport error: {}", e);
    TetherError::AuthenticationFailed
}
