//! RTC credentials.
//!
//! Media never flows through Ensemble. Participants talk to the RTC
//! provider directly, presenting a short-lived token that scopes them to
//! one channel (the session id) with one role. This module mints those
//! tokens through the [`RtcProvider`] collaborator and bounds every call
//! with a timeout, so a hung provider turns into a typed error instead of
//! a hung join.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ensemble_protocol::{CredentialGrant, RtcRole, SessionId, UserId};
use ensemble_session::Clock;
use ring::hmac;
use secrecy::{ExposeSecret, SecretString};

use crate::{CredentialError, ProviderError, after};

/// What the provider is asked to sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    pub channel: String,
    pub uid: UserId,
    pub role: RtcRole,
    pub expires_at: DateTime<Utc>,
}

/// The external RTC provider's token algorithm.
pub trait RtcProvider: Send + Sync + 'static {
    fn issue_token(
        &self,
        request: &TokenRequest,
    ) -> impl Future<Output = Result<String, ProviderError>> + Send;
}

/// Signs tokens locally with HMAC-SHA256 over a shared secret.
///
/// Token format: `hex(claims).hex(tag)` where claims are
/// `channel|uid|role|expiry_unix`. Identical requests produce identical
/// tokens.
pub struct HmacRtcProvider {
    key: hmac::Key,
}

impl HmacRtcProvider {
    pub fn new(secret: &SecretString) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.expose_secret().as_bytes()),
        }
    }

    /// Checks that `token` was signed by this provider for exactly
    /// `request`.
    pub fn verify(&self, token: &str, request: &TokenRequest) -> bool {
        let Some((claims_hex, tag_hex)) = token.split_once('.') else {
            return false;
        };
        let (Ok(claims), Ok(tag)) = (hex::decode(claims_hex), hex::decode(tag_hex)) else {
            return false;
        };
        claims == claims_of(request).as_bytes()
            && hmac::verify(&self.key, &claims, &tag).is_ok()
    }

    fn sign(&self, request: &TokenRequest) -> String {
        let claims = claims_of(request);
        let tag = hmac::sign(&self.key, claims.as_bytes());
        format!("{}.{}", hex::encode(claims), hex::encode(tag.as_ref()))
    }
}

impl std::fmt::Debug for HmacRtcProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacRtcProvider").finish_non_exhaustive()
    }
}

impl RtcProvider for HmacRtcProvider {
    async fn issue_token(&self, request: &TokenRequest) -> Result<String, ProviderError> {
        if request.channel.is_empty() {
            return Err(ProviderError::Rejected("empty channel name".into()));
        }
        Ok(self.sign(request))
    }
}

fn claims_of(request: &TokenRequest) -> String {
    format!(
        "{}|{}|{}|{}",
        request.channel,
        request.uid.0,
        request.role.as_str(),
        request.expires_at.timestamp()
    )
}

#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub token_ttl: Duration,
    /// Upper bound on a single provider call.
    pub provider_timeout: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(3600),
            provider_timeout: Duration::from_secs(2),
        }
    }
}

/// Mints [`CredentialGrant`]s through an [`RtcProvider`].
pub struct RtcCredentialIssuer<P: RtcProvider> {
    provider: Arc<P>,
    clock: Arc<dyn Clock>,
    config: CredentialConfig,
}

impl<P: RtcProvider> RtcCredentialIssuer<P> {
    pub fn new(provider: Arc<P>, clock: Arc<dyn Clock>, config: CredentialConfig) -> Self {
        Self {
            provider,
            clock,
            config,
        }
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Issues a credential for `user` on `session`'s channel, valid for
    /// the configured TTL from now. Refreshing is just issuing again.
    pub async fn issue(
        &self,
        session: &SessionId,
        user: UserId,
        role: RtcRole,
    ) -> Result<CredentialGrant, CredentialError> {
        let issued_at = self.clock.now();
        let request = TokenRequest {
            channel: session.to_string(),
            uid: user,
            role,
            expires_at: after(issued_at, self.config.token_ttl),
        };

        let token = tokio::time::timeout(
            self.config.provider_timeout,
            self.provider.issue_token(&request),
        )
        .await
        .map_err(|_| CredentialError::Timeout(self.config.provider_timeout))??;

        tracing::debug!(%session, %user, role = role.as_str(), "rtc credential issued");
        Ok(CredentialGrant {
            token,
            channel: request.channel,
            uid: user,
            role,
            issued_at,
            expires_at: request.expires_at,
        })
    }
}
