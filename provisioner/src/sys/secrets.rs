// provisioner/src/sys/secrets.rs

use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, Secret, SecretString};
use std::fs;
use std::path::Path;
use zeroize::Zeroizing;

use crate::error::{ProvisionError, Result};

/// Placeholder the backend ships as its JWT signing key default.
pub const SIGNING_KEY_PLACEHOLDER: &str = "your-secret-key";

/// The backend's single seeded user: table key, username and password literal.
pub const ADMIN_KEY_PLACEHOLDER: &str = "\"admin\": {";
pub const ADMIN_USERNAME_PLACEHOLDER: &str = "\"username\": \"admin\"";
pub const ADMIN_PASSWORD_PLACEHOLDER: &str = "\"password\": \"adminpassword\"";

const SIGNING_KEY_BYTES: usize = 32;

/// A freshly generated HMAC signing key, hex encoded.
///
/// 1. `Debug` prints `[REDACTED]`, so the key cannot end up in a log line.
/// 2. The backing `String` is zeroized when the key is dropped.
pub struct SigningKey {
    hex: SecretString,
}

impl SigningKey {
    /// 32 bytes from the OS CSPRNG, rendered as 64 lowercase hex characters.
    pub fn generate() -> Self {
        let mut raw = Zeroizing::new([0u8; SIGNING_KEY_BYTES]);
        OsRng.fill_bytes(raw.as_mut());
        Self {
            hex: Secret::new(hex::encode(raw.as_ref())),
        }
    }

    /// Exposes the key for the duration of `action` only.
    pub fn use_secret<F, R>(&self, action: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        action(self.hex.expose_secret())
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey([REDACTED])")
    }
}

/// Operator-supplied admin login for the backend.
#[derive(Debug)]
pub struct AdminCredentials {
    pub username: String,
    pub password: SecretString,
}

/// Everything secret collected or generated for one run.
#[derive(Debug)]
pub struct SecretsBundle {
    pub signing_key: SigningKey,
    pub admin: AdminCredentials,
}

/// Replaces `token` with `value`, insisting the token occurs exactly once.
/// Returns the observed count on mismatch.
pub fn replace_exactly_once(content: &str, token: &str, value: &str) -> std::result::Result<String, usize> {
    match content.matches(token).count() {
        1 => Ok(content.replacen(token, value, 1)),
        found => Err(found),
    }
}

/// Escapes a value for use inside a double-quoted Python string literal.
pub fn python_string_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

/// Writes the signing key over `SIGNING_KEY_PLACEHOLDER` in the backend entry
/// file. 🛡️ A missing or duplicated placeholder aborts: running with the
/// shipped default key is never acceptable.
pub fn inject_signing_key(entry_file: &Path, key: &SigningKey) -> Result<()> {
    let content = Zeroizing::new(fs::read_to_string(entry_file).map_err(ProvisionError::fs(entry_file))?);

    let patched = key.use_secret(|hex| replace_exactly_once(&content, SIGNING_KEY_PLACEHOLDER, hex));
    let patched = Zeroizing::new(patched.map_err(|found| ProvisionError::SecretInjection {
        path: entry_file.to_path_buf(),
        token: SIGNING_KEY_PLACEHOLDER.to_string(),
        found,
    })?);

    fs::write(entry_file, patched.as_bytes()).map_err(ProvisionError::fs(entry_file))
}

/// Replaces the seeded admin user with the operator's credentials.
/// All three placeholders are checked before the file is touched.
pub fn inject_admin_credentials(entry_file: &Path, admin: &AdminCredentials) -> Result<()> {
    let content = Zeroizing::new(fs::read_to_string(entry_file).map_err(ProvisionError::fs(entry_file))?);

    let username = python_string_escape(&admin.username);
    let password = Zeroizing::new(python_string_escape(admin.password.expose_secret()));

    let substitutions = [
        (ADMIN_KEY_PLACEHOLDER, Zeroizing::new(format!("\"{username}\": {{"))),
        (ADMIN_USERNAME_PLACEHOLDER, Zeroizing::new(format!("\"username\": \"{username}\""))),
        (
            ADMIN_PASSWORD_PLACEHOLDER,
            Zeroizing::new(format!("\"password\": \"{}\"", password.as_str())),
        ),
    ];

    let mut patched = Zeroizing::new(content.to_string());
    for (token, value) in &substitutions {
        let next = replace_exactly_once(&patched, token, value).map_err(|found| {
            ProvisionError::CredentialInjection {
                path: entry_file.to_path_buf(),
                token: token.to_string(),
                found,
            }
        })?;
        patched = Zeroizing::new(next);
    }

    fs::write(entry_file, patched.as_bytes()).map_err(ProvisionError::fs(entry_file))
}
