//! `hushpair:` connection strings
//!
//! Displayed as a QR code by the wallet and scanned by the companion app:
//!
//! ```text
//! hushpair:v1?id=<device id>&hint=direct|relayed&direct=<ws url>&relay=<wss url>&secret=<hex>
//! ```
//!
//! Both sides derive the relay rendezvous (the wormhole code) from the
//! shared secret, so the secret itself never reaches the relay.

use super::TransportKind;
use crate::error::WalletError;
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

pub const PAIRING_SCHEME: &str = "hushpair";
pub const PAIRING_VERSION: &str = "v1";

const SECRET_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionString {
    pub device_id: String,
    pub hint: TransportKind,
    pub direct: Option<Url>,
    pub relay: Option<Url>,
    /// Hex-encoded shared secret
    pub secret: String,
}

fn invalid(message: impl Into<String>) -> WalletError {
    WalletError::validation("connectionString", message)
}

impl ConnectionString {
    /// New pairing offer with a fresh random secret. The hint prefers the
    /// direct address when there is one.
    pub fn generate(device_id: impl Into<String>, direct: Option<Url>, relay: Option<Url>) -> Result<Self, WalletError> {
        let secret: [u8; SECRET_BYTES] = rand::random();
        let hint = if direct.is_some() {
            TransportKind::Direct
        } else {
            TransportKind::Relayed
        };
        let conn = Self {
            device_id: device_id.into(),
            hint,
            direct,
            relay,
            secret: hex::encode(secret),
        };
        conn.check()?;
        Ok(conn)
    }

    pub fn parse(text: &str) -> Result<Self, WalletError> {
        let url = Url::parse(text.trim()).map_err(|e| invalid(format!("not a pairing string: {}", e)))?;
        if url.scheme() != PAIRING_SCHEME {
            return Err(invalid(format!("expected a {}: string", PAIRING_SCHEME)));
        }
        if url.path() != PAIRING_VERSION {
            return Err(invalid(format!("unsupported pairing version '{}'", url.path())));
        }

        let mut device_id = None;
        let mut hint = None;
        let mut direct = None;
        let mut relay = None;
        let mut secret = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "id" => device_id = Some(value.into_owned()),
                "hint" => {
                    hint = Some(match value.as_ref() {
                        "direct" => TransportKind::Direct,
                        "relayed" => TransportKind::Relayed,
                        other => return Err(invalid(format!("unknown transport hint '{}'", other))),
                    })
                }
                "direct" => direct = Some(parse_ws_url(&value)?),
                "relay" => relay = Some(parse_ws_url(&value)?),
                "secret" => secret = Some(value.into_owned()),
                other => log::debug!("Ignoring pairing parameter '{}'", other),
            }
        }

        let conn = Self {
            device_id: device_id.ok_or_else(|| invalid("missing device id"))?,
            hint: hint.unwrap_or(TransportKind::Relayed),
            direct,
            relay,
            secret: secret.ok_or_else(|| invalid("missing secret"))?,
        };
        conn.check()?;
        Ok(conn)
    }

    fn check(&self) -> Result<(), WalletError> {
        if self.device_id.is_empty() {
            return Err(invalid("missing device id"));
        }
        if self.direct.is_none() && self.relay.is_none() {
            return Err(invalid("needs a direct or relay address"));
        }
        if self.hint == TransportKind::Direct && self.direct.is_none() {
            return Err(invalid("direct hint without a direct address"));
        }
        match hex::decode(&self.secret) {
            Ok(bytes) if bytes.len() >= SECRET_BYTES => Ok(()),
            Ok(_) => Err(invalid("secret is too short")),
            Err(_) => Err(invalid("secret is not hex")),
        }
    }

    /// Relay rendezvous code, hex(sha256(secret))
    pub fn wormhole_code(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Relay URL with the wormhole code attached
    pub fn relay_url(&self) -> Option<Url> {
        let mut url = self.relay.clone()?;
        url.query_pairs_mut().append_pair("code", &self.wormhole_code());
        Some(url)
    }
}

fn parse_ws_url(value: &str) -> Result<Url, WalletError> {
    let url = Url::parse(value).map_err(|e| invalid(format!("bad address '{}': {}", value, e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(invalid(format!("unsupported address scheme '{}'", other))),
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("id", &self.device_id);
        query.append_pair("hint", self.hint.as_str());
        if let Some(direct) = &self.direct {
            query.append_pair("direct", direct.as_str());
        }
        if let Some(relay) = &self.relay {
            query.append_pair("relay", relay.as_str());
        }
        query.append_pair("secret", &self.secret);
        write!(f, "{}:{}?{}", PAIRING_SCHEME, PAIRING_VERSION, query.finish())
    }
}
