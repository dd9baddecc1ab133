//! Credential provider (C9): resolves `(principal, secret)` for the
//! upstream authentication handshake from, in order, the `PX_PASSWORD`
//! env var, the OS keychain, or the platform SSPI sentinel.

use keyring::Entry;

use crate::auth::SSPI_SENTINEL_PRINCIPAL;
use crate::error::{PxError, Result};

const SERVICE: &str = "Px";

/// What C5 should install on the upstream connection: either an explicit
/// principal/secret pair, or the sentinel meaning "drive NTLM/Negotiate
/// with no explicit identity, let the platform supply one."
pub enum Credential {
    Explicit { principal: String, secret: String },
    PlatformSspi,
}

/// `get_credential(principal)` per the component's public operation.
pub fn get_credential(principal: &str) -> Result<Credential> {
    if principal.is_empty() {
        return if sspi::is_sspi_module_available() {
            Ok(Credential::PlatformSspi)
        } else {
            Err(PxError::NoCredential)
        };
    }

    if let Ok(secret) = std::env::var("PX_PASSWORD") {
        return Ok(Credential::Explicit {
            principal: principal.to_string(),
            secret,
        });
    }

    let entry = Entry::new(SERVICE, principal)?;
    let secret = entry.get_password()?;
    Ok(Credential::Explicit {
        principal: principal.to_string(),
        secret,
    })
}

/// Reads a password from the controlling TTY, stores it under `principal`,
/// then reads it back to verify the round trip — the interactive
/// `--password` action.
pub fn set_password_interactive(principal: &str) -> Result<()> {
    let secret = dialoguer::Password::new()
        .with_prompt(format!("Password for {principal}"))
        .interact()
        .map_err(|e| PxError::AuthHandshake(format!("failed to read password: {e}")))?;

    let entry = Entry::new(SERVICE, principal)?;
    entry.set_password(&secret)?;

    let roundtrip = entry.get_password()?;
    if roundtrip != secret {
        return Err(PxError::AuthHandshake(
            "keychain round-trip verification failed".to_string(),
        ));
    }
    Ok(())
}

/// `--password --remove <principal>`: deletes the stored credential.
pub fn remove_password(principal: &str) -> Result<()> {
    let entry = Entry::new(SERVICE, principal)?;
    entry.delete_credential()?;
    Ok(())
}

/// True if `principal` is the sentinel meaning "platform SSPI, no explicit
/// identity" rather than a real account name.
pub fn is_sspi_sentinel(principal: &str) -> bool {
    principal == SSPI_SENTINEL_PRINCIPAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_detection() {
        assert!(is_sspi_sentinel(":"));
        assert!(!is_sspi_sentinel("alice"));
    }

    #[test]
    fn empty_principal_without_sspi_is_no_credential_error() {
        if sspi::is_sspi_module_available() {
            return;
        }
        let err = get_credential("").unwrap_err();
        assert!(matches!(err, PxError::NoCredential));
    }

    #[test]
    fn px_password_env_overrides_keychain_lookup() {
        std::env::set_var("PX_PASSWORD", "from-env");
        let cred = get_credential("someone-unlikely-to-be-in-a-keychain").unwrap();
        match cred {
            Credential::Explicit { secret, .. } => assert_eq!(secret, "from-env"),
            Credential::PlatformSspi => panic!("expected explicit credential"),
        }
        std::env::remove_var("PX_PASSWORD");
    }
}
