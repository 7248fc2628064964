//! Device pairing bridge.
//!
//! Couples a user code typed on a secondary browser to a freshly minted,
//! short-lived consent session, so that device authorization goes through
//! the same consent resolvers as the browser flow. Raw user codes are never
//! stored or compared; only their signatures are.

use base64::Engine;
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::consent::protocol::DeviceAuthorizeParams;
use crate::consent::registry::RegisteredClient;
use crate::consent::resolver::{challenge_of, new_consent_session};
use crate::consent::store::ConsentStore;
use crate::consent::ConsentRequest;
use crate::entity::{consent_session, device_code_session};
use crate::entity::device_code_session::DeviceCodeStatus;
use crate::error::{ConsentError, ConsentStateError, SecurityViolation};

/// Canonical form of a user code: case and separators do not matter.
pub fn normalize_user_code(user_code: &str) -> String {
    user_code
        .chars()
        .filter(|c| !matches!(c, '-' | ' '))
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// One-way signature of a device or user code.
pub fn code_signature(code: &str) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(code.as_bytes()))
}

pub fn user_code_signature(user_code: &str) -> String {
    code_signature(&normalize_user_code(user_code))
}

/// A device session paired with its consent session.
#[derive(Debug, Clone)]
pub struct PairedDevice {
    pub device: device_code_session::Model,
    pub consent: consent_session::Model,
    pub request: ConsentRequest,
    pub challenge_id: Uuid,
}

pub struct DevicePairingBridge<'a> {
    store: &'a dyn ConsentStore,
    /// Lifetime of the bridging consent session
    lifespan: Duration,
}

impl<'a> DevicePairingBridge<'a> {
    pub fn new(store: &'a dyn ConsentStore, lifespan: Duration) -> Self {
        Self { store, lifespan }
    }

    /// Pair the device session identified by `user_code` with a new consent
    /// session bound to `subject`. A device session can be paired once.
    pub async fn pair(
        &self,
        client: &RegisteredClient,
        user_code: &str,
        subject: Uuid,
        now: OffsetDateTime,
    ) -> Result<PairedDevice, ConsentError> {
        let signature = user_code_signature(user_code);
        let device = self
            .store
            .load_device_session_by_user_code(&signature)
            .await?
            .ok_or(SecurityViolation::UnknownUserCode)?;

        if device.is_paired() {
            return Err(SecurityViolation::DeviceAlreadyPaired.into());
        }
        if device.client_id != client.id {
            return Err(SecurityViolation::DeviceClientMismatch.into());
        }
        if device.is_expired_at(now) {
            return Err(ConsentStateError::DeviceExpired.into());
        }
        if !device.is_pairable_at(now) {
            return Err(ConsentStateError::DeviceNotPending.into());
        }

        let request = DeviceAuthorizeParams::consent_request(&device)?;
        let consent = new_consent_session(&request, Some(subject), now, self.lifespan);
        let challenge_id = challenge_of(&consent)?;

        // an unpaired leftover consent session simply expires
        self.store.save_consent_session(&consent).await?;
        if !self.store.pair_device_session(device.id, challenge_id).await? {
            return Err(SecurityViolation::DeviceAlreadyPaired.into());
        }

        tracing::info!(
            target: "audit",
            device_session = device.id,
            %challenge_id,
            client_id = %client.id,
            "Consent session created for device"
        );

        let device = device_code_session::Model {
            challenge_id: Some(challenge_id.to_string()),
            ..device
        };
        Ok(PairedDevice {
            device,
            consent,
            request,
            challenge_id,
        })
    }

    /// Load an already paired device session by its consent challenge.
    pub async fn resume(
        &self,
        client: &RegisteredClient,
        challenge_id: Uuid,
        now: OffsetDateTime,
    ) -> Result<(device_code_session::Model, ConsentRequest), ConsentError> {
        if challenge_id.is_nil() {
            return Err(ConsentStateError::ZeroChallenge.into());
        }
        let device = self
            .store
            .load_device_session_by_challenge(challenge_id)
            .await?
            .ok_or(ConsentStateError::NotFound)?;

        if device.client_id != client.id {
            return Err(SecurityViolation::DeviceClientMismatch.into());
        }
        if device.is_expired_at(now) {
            return Err(ConsentStateError::DeviceExpired.into());
        }
        if !device.active || device.revoked || device.status() != DeviceCodeStatus::New {
            return Err(ConsentStateError::DeviceNotPending.into());
        }

        let request = DeviceAuthorizeParams::consent_request(&device)?;
        Ok((device, request))
    }

    /// Approve the device once its consent session is authorized.
    pub async fn approve(
        &self,
        device: &device_code_session::Model,
        challenge_id: Uuid,
        subject: Uuid,
        now: OffsetDateTime,
    ) -> Result<(), ConsentError> {
        if !self
            .store
            .approve_device_session(device.id, challenge_id, subject)
            .await?
        {
            return Err(ConsentStateError::DeviceNotPending.into());
        }
        if !self.store.grant_consent_session(challenge_id, now).await? {
            return Err(ConsentStateError::AlreadyGranted.into());
        }
        Ok(())
    }

    /// Flip the device session to denied instead of granting it.
    pub async fn deny(&self, device: &device_code_session::Model) -> Result<(), ConsentError> {
        self.store.deny_device_session(device.id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_codes_normalize_before_signing() {
        assert_eq!(normalize_user_code("wdjb-mjht"), "WDJBMJHT");
        assert_eq!(user_code_signature("wdjb-mjht"), user_code_signature("WDJB MJHT"));
        assert_ne!(user_code_signature("WDJBMJHT"), user_code_signature("WDJBMJHX"));
    }

    #[test]
    fn signatures_do_not_contain_the_code() {
        let signature = user_code_signature("WDJBMJHT");
        assert!(!signature.contains("WDJBMJHT"));
        assert_eq!(signature.len(), 43);
    }
}
