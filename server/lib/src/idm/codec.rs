//! JWT signing and verification.
//!
//! Outgoing tokens (id tokens, api tokens) are RS256 signed with the active
//! key, kid in the header. Verification resolves the kid against either our
//! own key store or an upstream JWKS document. Symmetric HS variants cover
//! client-secret signed artifacts such as the consent ticket.

use hashbrown::HashMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{
    decode, decode_header, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use openssl::pkey::PKey;
use openssl::sha;
use serde::de::DeserializeOwned;
use serde::Serialize;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::idm::keys::RsaKeyRecord;
use crate::prelude::*;

use tunnistamo_proto::jwk::JwkKeySet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Token is unsigned or carries an algorithm we do not accept.
    SignatureMissing,
    SignatureInvalid,
    TokenExpired,
    /// Signature fine, payload not acceptable.
    ClaimInvalid(String),
    Encoding,
}

impl From<jsonwebtoken::errors::Error> for CodecError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => CodecError::TokenExpired,
            ErrorKind::InvalidSignature => CodecError::SignatureInvalid,
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                CodecError::SignatureMissing
            }
            ErrorKind::InvalidAudience => CodecError::ClaimInvalid("aud".to_string()),
            ErrorKind::InvalidIssuer => CodecError::ClaimInvalid("iss".to_string()),
            ErrorKind::ImmatureSignature => CodecError::ClaimInvalid("nbf".to_string()),
            ErrorKind::MissingRequiredClaim(claim) => CodecError::ClaimInvalid(claim.clone()),
            _ => CodecError::SignatureInvalid,
        }
    }
}

impl From<CodecError> for OperationError {
    fn from(_: CodecError) -> Self {
        OperationError::CryptographyError
    }
}

/// RS256 signer bound to one stored private key.
pub struct JwsSigner {
    kid: String,
    encoding: EncodingKey,
}

impl JwsSigner {
    pub fn from_record(record: &RsaKeyRecord) -> Result<Self, OperationError> {
        let encoding = EncodingKey::from_rsa_pem(record.pem.as_bytes()).map_err(|err| {
            admin_error!(?err, kid = %record.kid, "Stored rsa key rejected by jwt library");
            OperationError::CryptographyError
        })?;
        Ok(JwsSigner {
            kid: record.kid.clone(),
            encoding,
        })
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn sign<C: Serialize>(&self, claims: &C) -> Result<String, CodecError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        encode(&header, claims, &self.encoding).map_err(|_| CodecError::Encoding)
    }
}

/// RS256 verifier over a set of public keys indexed by kid.
pub struct JwsVerifier {
    keys: HashMap<String, DecodingKey>,
}

impl JwsVerifier {
    /// Build from our own stored private keys.
    pub fn from_records(records: &[RsaKeyRecord]) -> Result<Self, OperationError> {
        let mut keys = HashMap::new();
        for record in records {
            let pkey = PKey::private_key_from_pem(record.pem.as_bytes()).map_err(|err| {
                admin_error!(?err, kid = %record.kid, "Stored rsa key does not parse");
                OperationError::CryptographyError
            })?;
            let public_pem = pkey
                .public_key_to_pem()
                .map_err(|_| OperationError::CryptographyError)?;
            let decoding = DecodingKey::from_rsa_pem(&public_pem)
                .map_err(|_| OperationError::CryptographyError)?;
            keys.insert(record.kid.clone(), decoding);
        }
        Ok(JwsVerifier { keys })
    }

    /// Build from a fetched upstream JWKS document.
    pub fn from_jwks(jwks: &JwkKeySet) -> Result<Self, OperationError> {
        let mut keys = HashMap::new();
        for jwk in &jwks.keys {
            if jwk.kty != "RSA" {
                continue;
            }
            let decoding = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
                .map_err(|_| OperationError::CryptographyError)?;
            keys.insert(jwk.kid.clone(), decoding);
        }
        Ok(JwsVerifier { keys })
    }

    /// Verify and deserialise. The kid header selects the key; an unknown
    /// kid is a signature failure, not a claim failure.
    pub fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        validation: &Validation,
    ) -> Result<T, CodecError> {
        let header = decode_header(token)?;
        if header.alg != Algorithm::RS256 {
            return Err(CodecError::SignatureMissing);
        }
        let kid = header.kid.ok_or(CodecError::SignatureInvalid)?;
        let key = self.keys.get(&kid).ok_or(CodecError::SignatureInvalid)?;
        decode::<T>(token, key, validation)
            .map(|data| data.claims)
            .map_err(CodecError::from)
    }
}

/// Standard validation for our own RS256 tokens.
pub fn rs256_validation(issuer: &str, audience: Option<&str>) -> Validation {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.leeway = DEFAULT_JWT_LEEWAY;
    validation.set_issuer(&[issuer]);
    match audience {
        Some(aud) => validation.set_audience(&[aud]),
        None => validation.validate_aud = false,
    }
    validation
}

pub fn hs_sign<C: Serialize>(
    alg: Algorithm,
    secret: &[u8],
    claims: &C,
) -> Result<String, CodecError> {
    let header = Header::new(alg);
    encode(&header, claims, &EncodingKey::from_secret(secret)).map_err(|_| CodecError::Encoding)
}

pub fn hs_verify<T: DeserializeOwned>(
    secret: &[u8],
    token: &str,
    validation: &Validation,
) -> Result<T, CodecError> {
    decode::<T>(token, &DecodingKey::from_secret(secret), validation)
        .map(|data| data.claims)
        .map_err(CodecError::from)
}

/// OIDC at_hash: left half of the sha256 of the access token, base64url.
pub fn at_hash(access_token: &str) -> String {
    let digest = sha::sha256(access_token.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::rsa::Rsa;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct TestClaims {
        iss: String,
        sub: String,
        exp: i64,
    }

    fn test_record(kid: &str) -> RsaKeyRecord {
        let rsa = Rsa::generate(2048).expect("keygen failed");
        let pkey = PKey::from_rsa(rsa).expect("pkey failed");
        RsaKeyRecord {
            kid: kid.to_string(),
            pem: String::from_utf8(pkey.private_key_to_pem_pkcs8().expect("pem failed"))
                .expect("utf8 failed"),
            created_at: 0,
            expired_at: None,
            managed: true,
        }
    }

    fn far_future() -> i64 {
        duration_from_epoch_now().as_secs() as i64 + 3600
    }

    #[test]
    fn test_sign_verify_kid_selection() {
        let record_a = test_record("a");
        let record_b = test_record("b");
        let signer = JwsSigner::from_record(&record_a).expect("signer failed");
        let token = signer
            .sign(&TestClaims {
                iss: "https://sso.example.com".to_string(),
                sub: "u-1".to_string(),
                exp: far_future(),
            })
            .expect("sign failed");

        let validation = rs256_validation("https://sso.example.com", None);

        // Both keys loaded: the kid routes to the right one.
        let verifier =
            JwsVerifier::from_records(&[record_b.clone(), record_a.clone()]).expect("verifier");
        let claims: TestClaims = verifier.verify(&token, &validation).expect("verify failed");
        assert_eq!(claims.sub, "u-1");

        // Only the wrong key loaded: signature failure.
        let verifier = JwsVerifier::from_records(&[record_b]).expect("verifier");
        let err = verifier
            .verify::<TestClaims>(&token, &validation)
            .expect_err("must not verify");
        assert_eq!(err, CodecError::SignatureInvalid);

        // Wrong issuer: claim failure.
        let verifier = JwsVerifier::from_records(&[record_a]).expect("verifier");
        let validation = rs256_validation("https://other.example.com", None);
        let err = verifier
            .verify::<TestClaims>(&token, &validation)
            .expect_err("must not verify");
        assert_eq!(err, CodecError::ClaimInvalid("iss".to_string()));
    }

    #[test]
    fn test_expired_token() {
        let record = test_record("a");
        let signer = JwsSigner::from_record(&record).expect("signer failed");
        let token = signer
            .sign(&TestClaims {
                iss: "https://sso.example.com".to_string(),
                sub: "u-1".to_string(),
                exp: duration_from_epoch_now().as_secs() as i64 - 3600,
            })
            .expect("sign failed");
        let verifier = JwsVerifier::from_records(&[record]).expect("verifier");
        let err = verifier
            .verify::<TestClaims>(&token, &rs256_validation("https://sso.example.com", None))
            .expect_err("must not verify");
        assert_eq!(err, CodecError::TokenExpired);
    }

    #[test]
    fn test_hs_roundtrip() {
        let secret = b"client-secret";
        let claims = TestClaims {
            iss: "https://sso.example.com".to_string(),
            sub: "u-1".to_string(),
            exp: far_future(),
        };
        let token = hs_sign(Algorithm::HS256, secret, &claims).expect("sign failed");
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&["https://sso.example.com"]);
        validation.validate_aud = false;
        let back: TestClaims = hs_verify(secret, &token, &validation).expect("verify failed");
        assert_eq!(back.sub, "u-1");
        assert!(hs_verify::<TestClaims>(b"wrong", &token, &validation).is_err());
    }

    #[test]
    fn test_at_hash_shape() {
        let hash = at_hash("dNZX1hEZ9wBCzNL40Upu646bdzQA");
        // 128 bits base64url unpadded.
        assert_eq!(hash.len(), 22);
    }
}
