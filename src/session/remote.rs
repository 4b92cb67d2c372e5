//! The remote side of a publish session
//!
//! A session talks to two remote operations: uploading a serialized object
//! pack and committing the root hash transition once every pack has landed.
//! [`GatewayClient`] implements both against the repository gateway HTTP API.

use crate::error::{IngestError, Result};
use crate::hash::ContentHash;
use crate::session::pack::ObjectPack;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::time::Duration;

pub const GATEWAY_API_VERSION: u32 = 2;

/// Endpoint and credentials of one publish session
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    #[serde(rename = "api-url")]
    pub api_url: String,
    #[serde(rename = "session-token")]
    pub session_token: String,
    #[serde(rename = "key-id")]
    pub key_id: String,
    pub secret: String,
}

impl SessionCredentials {
    pub fn new(
        api_url: impl Into<String>,
        session_token: impl Into<String>,
        key_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            session_token: session_token.into(),
            key_id: key_id.into(),
            secret: secret.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_url.is_empty() {
            return Err(IngestError::invalid_parameter(
                "api-url",
                "API URL cannot be empty",
            ));
        }
        if self.session_token.is_empty() {
            return Err(IngestError::invalid_parameter(
                "session-token",
                "Session token cannot be empty",
            ));
        }
        if self.key_id.is_empty() {
            return Err(IngestError::invalid_parameter(
                "key-id",
                "Key ID cannot be empty",
            ));
        }
        Ok(())
    }

    /// `Authorization` header value for a request body
    pub fn authorization(&self, message: &[u8]) -> Result<String> {
        Ok(format!("{} {}", self.key_id, sign(&self.secret, message)?))
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("api_url", &self.api_url)
            .field("session_token", &"<redacted>")
            .field("key_id", &self.key_id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Base64 HMAC-SHA256 of `message` keyed with `secret`
pub fn sign(secret: &str, message: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| IngestError::config_error(format!("invalid session secret: {}", e)))?;
    mac.update(message);
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

/// The root hash transition recorded by a session commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub old_root_hash: String,
    pub new_root_hash: String,
    pub tag_name: String,
    pub tag_channel: String,
    pub tag_description: String,
}

impl CommitRequest {
    /// A commit with the default generic tag
    pub fn new(old_root_hash: impl Into<String>, new_root_hash: impl Into<String>) -> Self {
        Self {
            old_root_hash: old_root_hash.into(),
            new_root_hash: new_root_hash.into(),
            tag_name: generic_tag_name(chrono::Utc::now()),
            tag_channel: String::new(),
            tag_description: String::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.old_root_hash.is_empty() || self.new_root_hash.is_empty() {
            return Err(IngestError::invalid_parameter(
                "root_hash",
                "old and new root hash must both be set",
            ));
        }
        Ok(())
    }
}

/// Tag name used when a publish does not name its tag
pub fn generic_tag_name(at: chrono::DateTime<chrono::Utc>) -> String {
    format!("generic-{}", at.format("%Y-%m-%dT%H:%M:%S%.3fZ"))
}

/// The JSON message preceding a pack in a payload submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadMessage {
    pub session_token: String,
    pub payload_digest: String,
    pub header_size: String,
    pub api_version: String,
}

impl PayloadMessage {
    pub fn new(credentials: &SessionCredentials, header: &str, payload: &[u8]) -> Self {
        Self {
            session_token: credentials.session_token.clone(),
            payload_digest: ContentHash::compute(payload).to_hex(),
            header_size: header.len().to_string(),
            api_version: GATEWAY_API_VERSION.to_string(),
        }
    }
}

/// Reply of the gateway to either request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayReply {
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl GatewayReply {
    pub fn into_result(self, operation: &str) -> Result<()> {
        if self.status == "ok" {
            Ok(())
        } else {
            Err(IngestError::gateway_rejected(
                operation,
                self.reason.unwrap_or(self.status),
            ))
        }
    }
}

/// Remote operations a session depends on
pub trait SessionRemote: Send + Sync {
    /// Upload one sealed pack
    fn upload_pack(&self, credentials: &SessionCredentials, pack: &ObjectPack) -> Result<()>;

    /// Record the root hash transition of the session
    fn commit(&self, credentials: &SessionCredentials, request: &CommitRequest) -> Result<()>;
}

/// Gateway HTTP API client
pub struct GatewayClient {
    client: reqwest::blocking::Client,
}

impl GatewayClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("publish-ingest/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()?;
        Ok(Self { client })
    }

    fn url(credentials: &SessionCredentials, path: &str) -> String {
        format!("{}/{}", credentials.api_url.trim_end_matches('/'), path)
    }
}

impl SessionRemote for GatewayClient {
    fn upload_pack(&self, credentials: &SessionCredentials, pack: &ObjectPack) -> Result<()> {
        let header = pack.header();
        let payload = pack.serialize();
        let message = serde_json::to_vec(&PayloadMessage::new(credentials, &header, &payload))?;

        let mut body = Vec::with_capacity(message.len() + payload.len());
        body.extend_from_slice(&message);
        body.extend_from_slice(&payload);

        debug!(
            "POST payload: {} objects, {} bytes",
            pack.len(),
            body.len()
        );
        let reply: GatewayReply = self
            .client
            .post(Self::url(credentials, "payloads"))
            .header("Authorization", credentials.authorization(&message)?)
            .header("Message-Size", message.len().to_string())
            .body(body)
            .send()?
            .error_for_status()?
            .json()?;
        reply.into_result("payload upload")
    }

    fn commit(&self, credentials: &SessionCredentials, request: &CommitRequest) -> Result<()> {
        request.validate()?;
        let path = format!("leases/{}", credentials.session_token);

        debug!(
            "POST commit: {} -> {}",
            request.old_root_hash, request.new_root_hash
        );
        let reply: GatewayReply = self
            .client
            .post(Self::url(credentials, &path))
            .header(
                "Authorization",
                credentials.authorization(credentials.session_token.as_bytes())?,
            )
            .json(request)
            .send()?
            .error_for_status()?
            .json()?;
        reply.into_result("commit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn credentials() -> SessionCredentials {
        SessionCredentials::new("http://gw:4929/api/v1/", "token-1", "key-a", "s3cr3t")
    }

    #[test]
    fn test_sign_known_vector() {
        // RFC 4231 test case 2
        let signature = sign("Jefe", b"what do ya want for nothing?").unwrap();
        let expected = STANDARD.encode(
            hex::decode("5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843")
                .unwrap(),
        );
        assert_eq!(signature, expected);
    }

    #[test]
    fn test_authorization_header() {
        let creds = credentials();
        let auth = creds.authorization(b"{}").unwrap();
        assert_eq!(auth, format!("key-a {}", sign("s3cr3t", b"{}").unwrap()));
    }

    #[test]
    fn test_credentials_debug_redacts() {
        let printed = format!("{:?}", credentials());
        assert!(!printed.contains("s3cr3t"));
        assert!(!printed.contains("token-1"));
        assert!(printed.contains("key-a"));
    }

    #[test]
    fn test_credentials_validate() {
        assert!(credentials().validate().is_ok());
        let mut creds = credentials();
        creds.session_token.clear();
        assert!(creds.validate().is_err());
    }

    #[test]
    fn test_payload_message() {
        let message = PayloadMessage::new(&credentials(), "V2\n", b"V2\npayload");
        assert_eq!(message.session_token, "token-1");
        assert_eq!(message.header_size, "3");
        assert_eq!(message.api_version, "2");
        assert_eq!(
            message.payload_digest,
            ContentHash::compute(b"V2\npayload").to_hex()
        );
    }

    #[test]
    fn test_commit_request() {
        let request = CommitRequest::new("old", "new");
        assert!(request.tag_name.starts_with("generic-"));
        assert!(request.validate().is_ok());
        assert!(CommitRequest::new("", "new").validate().is_err());

        let at = chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(generic_tag_name(at), "generic-2024-03-01T12:30:05.000Z");
    }

    #[test]
    fn test_gateway_reply() {
        let ok: GatewayReply = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert!(ok.into_result("commit").is_ok());

        let err: GatewayReply =
            serde_json::from_str(r#"{"status":"error","reason":"lease expired"}"#).unwrap();
        match err.into_result("commit") {
            Err(IngestError::GatewayRejected { reason, .. }) => assert_eq!(reason, "lease expired"),
            other => panic!("Expected GatewayRejected, got: {:?}", other),
        }
    }

    #[test]
    fn test_url_join() {
        assert_eq!(
            GatewayClient::url(&credentials(), "payloads"),
            "http://gw:4929/api/v1/payloads"
        );
    }
}
