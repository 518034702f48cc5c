//! Credential storage seam.
//!
//! The source hard-codes `app_id`/`app_key` as string literals in
//! `ai_volc_conversation.c`. Hard-coding credentials is something a real
//! client must not do; this module is the resolution: a small trait so a
//! host can plug in whatever secret store it already has, plus two
//! concrete implementations.

use crate::engine::realtime::RealtimeAuth;

/// Looks up realtime-backend credentials by a caller-chosen key (the
/// engine type name, e.g. `"realtime"`). Implementors decide what that
/// key means for their backing store.
pub trait CredentialStore: Send + Sync {
    fn get(&self, engine_type: &str) -> Option<RealtimeAuth>;
}

/// Default store: reads `VOICE_SESSION_APP_ID` / `VOICE_SESSION_APP_KEY` /
/// `VOICE_SESSION_MODEL` from the process environment. Ignores
/// `engine_type` — there is only one realtime backend today.
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn get(&self, _engine_type: &str) -> Option<RealtimeAuth> {
        let app_id = std::env::var("VOICE_SESSION_APP_ID").ok()?;
        let app_key = std::env::var("VOICE_SESSION_APP_KEY").ok()?;
        let model = std::env::var("VOICE_SESSION_MODEL").unwrap_or_default();
        if app_id.trim().is_empty() || app_key.trim().is_empty() {
            return None;
        }
        Some(RealtimeAuth { app_id, app_key, model })
    }
}

/// OS-native secure storage (Keychain / Credential Manager / Secret
/// Service) via the `keyring` crate, gated behind the `secure-storage`
/// feature so the default build carries no native-keystore dependency.
#[cfg(feature = "secure-storage")]
pub struct KeyringCredentialStore {
    service: String,
}

#[cfg(feature = "secure-storage")]
impl KeyringCredentialStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    fn read(&self, user: &str) -> Option<String> {
        keyring::Entry::new(&self.service, user)
            .ok()?
            .get_password()
            .ok()
    }
}

#[cfg(feature = "secure-storage")]
impl CredentialStore for KeyringCredentialStore {
    fn get(&self, engine_type: &str) -> Option<RealtimeAuth> {
        let app_id = self.read(&format!("{engine_type}.app_id"))?;
        let app_key = self.read(&format!("{engine_type}.app_key"))?;
        let model = self.read(&format!("{engine_type}.model")).unwrap_or_default();
        if app_id.trim().is_empty() || app_key.trim().is_empty() {
            return None;
        }
        Some(RealtimeAuth { app_id, app_key, model })
    }
}
