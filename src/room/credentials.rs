//! Room access credentials.
//!
//! Each bridge participant gets a LiveKit access token signed with the
//! configured API key and secret. The token carries the participant's
//! identity and grants to join exactly one room, publish and subscribe.
//! [`RoomCredentials`] keeps the same facts in plain form so room backends
//! can check them without decoding the token.

use crate::config::RoomConfig;
use crate::error::{BridgeError, BridgeResult};
use chrono::{DateTime, Utc};
use livekit_api::access_token::{AccessToken, VideoGrants};
use std::time::Duration;

/// Permissions scoped to a single room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomGrants {
    pub room: String,
    pub room_join: bool,
    pub can_publish: bool,
    pub can_subscribe: bool,
}

/// Short-lived credentials for one participant in one room.
#[derive(Debug, Clone)]
pub struct RoomCredentials {
    pub identity: String,
    pub display_name: String,
    pub grants: RoomGrants,
    pub expires_at: DateTime<Utc>,
    /// Signed JWT presented to the room server
    pub token: String,
}

impl RoomCredentials {
    /// Whether these credentials let the holder join `room_name` right now.
    pub fn permits_join(&self, room_name: &str) -> bool {
        self.grants.room_join && self.grants.room == room_name && self.expires_at > Utc::now()
    }
}

/// Source of room credentials for bridge participants.
pub trait CredentialIssuer: Send + Sync {
    fn issue(
        &self,
        room_name: &str,
        identity: &str,
        display_name: &str,
    ) -> BridgeResult<RoomCredentials>;
}

/// Signs publish+subscribe tokens with the configured API key and secret.
#[derive(Clone)]
pub struct ConfiguredCredentialIssuer {
    api_key: String,
    api_secret: String,
    ttl: Duration,
}

impl ConfiguredCredentialIssuer {
    pub fn new(config: &RoomConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            ttl: Duration::from_secs(config.credential_ttl_secs),
        }
    }
}

impl CredentialIssuer for ConfiguredCredentialIssuer {
    fn issue(
        &self,
        room_name: &str,
        identity: &str,
        display_name: &str,
    ) -> BridgeResult<RoomCredentials> {
        if room_name.is_empty() {
            return Err(BridgeError::RoomConnect("room name is empty".to_string()));
        }
        if identity.is_empty() {
            return Err(BridgeError::RoomConnect("participant identity is empty".to_string()));
        }

        let grants = RoomGrants {
            room: room_name.to_string(),
            room_join: true,
            can_publish: true,
            can_subscribe: true,
        };

        let token = AccessToken::with_api_key(&self.api_key, &self.api_secret)
            .with_identity(identity)
            .with_name(display_name)
            .with_grants(VideoGrants {
                room: grants.room.clone(),
                room_join: grants.room_join,
                can_publish: grants.can_publish,
                can_subscribe: grants.can_subscribe,
                ..Default::default()
            })
            .with_ttl(self.ttl)
            .to_jwt()
            .map_err(|e| BridgeError::RoomConnect(format!("could not sign room token: {}", e)))?;

        Ok(RoomCredentials {
            identity: identity.to_string(),
            display_name: display_name.to_string(),
            grants,
            expires_at: Utc::now() + chrono::Duration::seconds(self.ttl.as_secs() as i64),
            token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use livekit_api::access_token::TokenVerifier;

    #[test]
    fn test_issued_credentials_are_scoped_to_one_room() {
        let issuer = ConfiguredCredentialIssuer::new(&AppConfig::default().room);
        let creds = issuer.issue("call-CA1", "phone-+15550100", "Phone Caller").unwrap();

        assert!(creds.grants.can_publish);
        assert!(creds.grants.can_subscribe);
        assert!(creds.permits_join("call-CA1"));
        assert!(!creds.permits_join("call-CA2"));
    }

    #[test]
    fn test_token_is_signed_with_the_api_secret() {
        let config = AppConfig::default().room;
        let issuer = ConfiguredCredentialIssuer::new(&config);
        let creds = issuer.issue("call-CA1", "phone-+15550100", "Phone Caller").unwrap();

        let claims = TokenVerifier::with_api_key(&config.api_key, &config.api_secret)
            .verify(&creds.token)
            .unwrap();
        assert_eq!(claims.sub, "phone-+15550100");
        assert_eq!(claims.name, "Phone Caller");
        assert_eq!(claims.video.room, "call-CA1");
        assert!(claims.video.room_join);
        assert!(claims.video.can_publish);
        assert!(claims.video.can_subscribe);

        let forged = TokenVerifier::with_api_key(&config.api_key, "not-the-secret").verify(&creds.token);
        assert!(forged.is_err());
    }

    #[test]
    fn test_empty_room_is_rejected() {
        let issuer = ConfiguredCredentialIssuer::new(&AppConfig::default().room);
        assert!(issuer.issue("", "phone-1", "Phone Caller").is_err());
    }
}
