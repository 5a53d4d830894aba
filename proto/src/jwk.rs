//! JSON Web Key types for the JWKS document.

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// A single RSA public key, url-safe unpadded base64 components.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_: Option<String>,
    pub kid: String,
    pub alg: Option<String>,
    pub n: String,
    pub e: String,
}

impl Jwk {
    pub fn rsa_sig(kid: impl Into<String>, n: impl Into<String>, e: impl Into<String>) -> Self {
        Jwk {
            kty: "RSA".to_string(),
            use_: Some("sig".to_string()),
            kid: kid.into(),
            alg: Some("RS256".to_string()),
            n: n.into(),
            e: e.into(),
        }
    }
}

/// An elliptic curve key as exchanged with registered user devices. The
/// private scalar `d` is present only in the server-generated half handed
/// to the device at registration.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EcJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    pub d: Option<String>,
}

impl EcJwk {
    pub fn is_p256(&self) -> bool {
        self.kty == "EC" && self.crv == "P-256"
    }

    /// The public half, safe to store and to echo back.
    pub fn public(&self) -> EcJwk {
        EcJwk {
            d: None,
            ..self.clone()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct JwkKeySet {
    pub keys: Vec<Jwk>,
}

impl JwkKeySet {
    pub fn key_by_kid(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}
