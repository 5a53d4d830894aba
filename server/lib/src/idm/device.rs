//! User devices, interface devices and external identity linkage.
//!
//! A user device registers an EC P-256 public key over a bearer token with
//! the `devices` scope; the server generates a key pair of its own and hands
//! the private half back exactly once. Later the device proves itself with an
//! ES256 assertion carrying a strictly increasing counter.
//!
//! Interface devices are fixed terminals holding a shared secret; they
//! authenticate with an HS256 assertion and act within their configured
//! scopes.
//!
//! Identity linkage attaches an external identifier (a library card) to a
//! user after the owning service has validated the credentials.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use openssl::bn::{BigNum, BigNumContext};
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use tunnistamo_proto::jwk::EcJwk;

use crate::be::{from_json_text, sqlite_err, to_json_text};
use crate::idm::codec;
use crate::idm::oauth2::{scoped_bearer, Oauth2Error};
use crate::idm::server::IdmServer;
use crate::prelude::*;

/// Assertions older than this are replayable and refused.
const DEVICE_ASSERTION_MAX_AGE_SECONDS: u64 = 300;

#[derive(Debug, Clone)]
pub struct UserDevice {
    pub id: Uuid,
    pub user_uuid: Uuid,
    /// The device's own public key, verified against at authentication.
    pub public_key: EcJwk,
    /// Server-generated pair returned to the device at registration.
    pub secret_key: EcJwk,
    pub auth_counter: i64,
    pub last_used_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct InterfaceDevice {
    pub id: Uuid,
    pub secret_key: String,
    pub scopes: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: Uuid,
    pub user_uuid: Uuid,
    pub service: String,
    pub identifier: String,
    pub created_at: i64,
}

/// What a device signs to authenticate. The counter must strictly exceed
/// the stored one.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceAssertionClaims {
    pub iat: i64,
    pub counter: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InterfaceAssertionClaims {
    pub iat: i64,
}

/// Outcome of an identity linkage attempt against the external validator.
/// The HTTP layer maps the first two to 401 with the matching error code
/// and `NotImplemented` to 501.
#[derive(Debug, PartialEq, Eq)]
pub enum IdentityLinkError {
    /// Bearer token invalid, expired, short on scope or session-ended.
    InvalidToken,
    /// The validator could not be reached in time.
    ServiceUnavailable,
    InvalidCredentials,
    /// No validator configured for the service, or the validator answered
    /// something we do not understand.
    NotImplemented,
    ServerError(OperationError),
}

impl From<OperationError> for IdentityLinkError {
    fn from(err: OperationError) -> Self {
        IdentityLinkError::ServerError(err)
    }
}

/// Error body shape of the helmet patron validator.
#[derive(Debug, Deserialize)]
struct ValidatorErrorBody {
    #[serde(default)]
    code: Option<i64>,
}

impl IdmServer {
    /// Register a device for the bearer token's user. The returned record
    /// carries the generated private half; it is never retrievable again.
    #[instrument(level = "debug", skip_all)]
    pub async fn device_register(
        &self,
        access_token: &str,
        public_key: &EcJwk,
        ct: Duration,
    ) -> Result<UserDevice, Oauth2Error> {
        if !public_key.is_p256() {
            return Err(Oauth2Error::InvalidRequest);
        }
        // Coordinates must parse before we accept the key for later
        // verification.
        DecodingKey::from_ec_components(&public_key.x, &public_key.y)
            .map_err(|_| Oauth2Error::InvalidRequest)?;

        let secret_key = generate_p256_jwk().map_err(Oauth2Error::ServerError)?;
        let access_token = access_token.to_string();
        let public_key = public_key.clone();
        self.db
            .with_write(move |txn| {
                let token = match scoped_bearer(txn, &access_token, OAUTH2_SCOPE_DEVICES, ct)? {
                    Some(token) => token,
                    None => return Ok(Err(Oauth2Error::InvalidToken)),
                };
                let device = UserDevice {
                    id: Uuid::new_v4(),
                    user_uuid: token.user_uuid,
                    public_key: public_key.public(),
                    secret_key,
                    auth_counter: 0,
                    last_used_at: None,
                };
                device_insert(txn, &device)?;
                security_info!(device_id = %device.id, user_uuid = %device.user_uuid, "Registered user device");
                Ok(Ok(device))
            })
            .await
            .map_err(Oauth2Error::ServerError)?
    }

    pub async fn device_list(
        &self,
        access_token: &str,
        ct: Duration,
    ) -> Result<Vec<UserDevice>, Oauth2Error> {
        let access_token = access_token.to_string();
        self.db
            .with_read(move |txn| {
                let token = match scoped_bearer(txn, &access_token, OAUTH2_SCOPE_DEVICES, ct)? {
                    Some(token) => token,
                    None => return Ok(Err(Oauth2Error::InvalidToken)),
                };
                Ok(Ok(devices_for_user(txn, token.user_uuid)?))
            })
            .await
            .map_err(Oauth2Error::ServerError)?
    }

    /// Remove one of the bearer user's own devices. Another user's device
    /// id is indistinguishable from an unknown one.
    #[instrument(level = "debug", skip_all)]
    pub async fn device_delete(
        &self,
        access_token: &str,
        device_id: Uuid,
        ct: Duration,
    ) -> Result<(), Oauth2Error> {
        let access_token = access_token.to_string();
        self.db
            .with_write(move |txn| {
                let token = match scoped_bearer(txn, &access_token, OAUTH2_SCOPE_DEVICES, ct)? {
                    Some(token) => token,
                    None => return Ok(Err(Oauth2Error::InvalidToken)),
                };
                match device_get(txn, device_id)? {
                    Some(device) if device.user_uuid == token.user_uuid => {
                        device_delete(txn, device_id)?;
                        Ok(Ok(()))
                    }
                    _ => Ok(Err(Oauth2Error::InvalidRequest)),
                }
            })
            .await
            .map_err(Oauth2Error::ServerError)?
    }

    /// Verify a device's ES256 assertion and advance its counter. A counter
    /// at or below the stored value is a replay.
    #[instrument(level = "debug", skip_all)]
    pub async fn device_authenticate(
        &self,
        device_id: Uuid,
        assertion: &str,
        ct: Duration,
    ) -> Result<UserDevice, OperationError> {
        let assertion = assertion.to_string();
        self.db
            .with_write(move |txn| {
                let mut device =
                    device_get(txn, device_id)?.ok_or(OperationError::NoMatchingEntries)?;
                let decoding =
                    DecodingKey::from_ec_components(&device.public_key.x, &device.public_key.y)
                        .map_err(|_| OperationError::CryptographyError)?;
                let claims: DeviceAssertionClaims =
                    jsonwebtoken::decode(&assertion, &decoding, &assertion_validation(
                        Algorithm::ES256,
                    ))
                    .map(|data| data.claims)
                    .map_err(|err| {
                        security_error!(%device_id, ?err, "Device assertion rejected");
                        OperationError::AccessDenied
                    })?;
                if !iat_fresh(claims.iat, ct) {
                    security_error!(%device_id, iat = claims.iat, "Stale device assertion");
                    return Err(OperationError::AccessDenied);
                }
                if claims.counter <= device.auth_counter {
                    security_error!(
                        %device_id,
                        presented = claims.counter,
                        stored = device.auth_counter,
                        "Device assertion counter replayed"
                    );
                    return Err(OperationError::AccessDenied);
                }
                device.auth_counter = claims.counter;
                device.last_used_at = Some(ct.as_secs() as i64);
                device_touch(txn, &device)?;
                security_access!(%device_id, user_uuid = %device.user_uuid, "Device authenticated");
                Ok(device)
            })
            .await
    }

    /// Create a fixed terminal credential. The secret is generated here and
    /// shown once by the caller.
    pub async fn interface_device_create(
        &self,
        scopes: BTreeSet<String>,
    ) -> Result<InterfaceDevice, OperationError> {
        let device = InterfaceDevice {
            id: Uuid::new_v4(),
            secret_key: crate::utils::generate_opaque_token(),
            scopes,
        };
        let stored = device.clone();
        self.db
            .with_write(move |txn| interface_device_insert(txn, &stored))
            .await?;
        Ok(device)
    }

    /// Verify a terminal's HS256 assertion; returns the scopes it may act
    /// within.
    #[instrument(level = "debug", skip_all)]
    pub async fn interface_device_authenticate(
        &self,
        device_id: Uuid,
        assertion: &str,
        ct: Duration,
    ) -> Result<BTreeSet<String>, OperationError> {
        let assertion = assertion.to_string();
        self.db
            .with_read(move |txn| {
                let device = interface_device_get(txn, device_id)?
                    .ok_or(OperationError::NoMatchingEntries)?;
                let claims: InterfaceAssertionClaims = codec::hs_verify(
                    device.secret_key.as_bytes(),
                    &assertion,
                    &assertion_validation(Algorithm::HS256),
                )
                .map_err(|err| {
                    security_error!(%device_id, ?err, "Interface device assertion rejected");
                    OperationError::AccessDenied
                })?;
                if !iat_fresh(claims.iat, ct) {
                    security_error!(%device_id, iat = claims.iat, "Stale interface device assertion");
                    return Err(OperationError::AccessDenied);
                }
                Ok(device.scopes)
            })
            .await
    }

    /// Link an external identity to the bearer user after validating the
    /// credentials with the owning service.
    #[instrument(level = "info", skip(self, access_token, secret))]
    pub async fn identity_link(
        &self,
        access_token: &str,
        service: &str,
        identifier: &str,
        secret: &str,
        ct: Duration,
    ) -> Result<UserIdentity, IdentityLinkError> {
        let access_token_q = access_token.to_string();
        let user_uuid = self
            .db
            .with_read(move |txn| {
                Ok(scoped_bearer(txn, &access_token_q, OAUTH2_SCOPE_IDENTITIES, ct)?
                    .map(|token| token.user_uuid))
            })
            .await?
            .ok_or(IdentityLinkError::InvalidToken)?;

        let validator = self
            .config
            .identity_validators
            .get(service)
            .ok_or(IdentityLinkError::NotImplemented)?
            .clone();
        self.validate_identity(&validator, identifier, secret).await?;

        let identity = UserIdentity {
            id: Uuid::new_v4(),
            user_uuid,
            service: service.to_string(),
            identifier: identifier.to_string(),
            created_at: ct.as_secs() as i64,
        };
        let stored = identity.clone();
        self.db
            .with_write(move |txn| identity_upsert(txn, &stored))
            .await?;
        security_info!(%user_uuid, service = %identity.service, "Linked external identity");
        Ok(identity)
    }

    pub async fn identity_list(
        &self,
        access_token: &str,
        ct: Duration,
    ) -> Result<Vec<UserIdentity>, Oauth2Error> {
        let access_token = access_token.to_string();
        self.db
            .with_read(move |txn| {
                let token = match scoped_bearer(txn, &access_token, OAUTH2_SCOPE_IDENTITIES, ct)? {
                    Some(token) => token,
                    None => return Ok(Err(Oauth2Error::InvalidToken)),
                };
                Ok(Ok(identities_for_user(txn, token.user_uuid)?))
            })
            .await
            .map_err(Oauth2Error::ServerError)?
    }

    pub async fn identity_delete(
        &self,
        access_token: &str,
        identity_id: Uuid,
        ct: Duration,
    ) -> Result<(), Oauth2Error> {
        let access_token = access_token.to_string();
        self.db
            .with_write(move |txn| {
                let token = match scoped_bearer(txn, &access_token, OAUTH2_SCOPE_IDENTITIES, ct)? {
                    Some(token) => token,
                    None => return Ok(Err(Oauth2Error::InvalidToken)),
                };
                let n = txn
                    .execute(
                        "DELETE FROM user_identities WHERE id = ?1 AND user_uuid = ?2",
                        params![identity_id.to_string(), token.user_uuid.to_string()],
                    )
                    .map_err(sqlite_err)?;
                if n == 0 {
                    Ok(Err(Oauth2Error::InvalidRequest))
                } else {
                    Ok(Ok(()))
                }
            })
            .await
            .map_err(Oauth2Error::ServerError)?
    }

    /// One call against the external validator. 204 is the only success.
    async fn validate_identity(
        &self,
        validator: &Url,
        identifier: &str,
        secret: &str,
    ) -> Result<(), IdentityLinkError> {
        let response = self
            .http
            .post(validator.clone())
            .json(&serde_json::json!({
                "identifier": identifier,
                "secret": secret,
            }))
            .send()
            .await
            .map_err(|err| {
                request_warn!(?err, "Identity validator unreachable");
                IdentityLinkError::ServiceUnavailable
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(());
        }
        let code = response
            .json::<ValidatorErrorBody>()
            .await
            .ok()
            .and_then(|body| body.code);
        match (status.as_u16(), code) {
            (400, Some(108)) | (403, Some(143)) => Err(IdentityLinkError::InvalidCredentials),
            _ => {
                admin_warn!(%status, ?code, "Identity validator answered out of protocol");
                Err(IdentityLinkError::NotImplemented)
            }
        }
    }
}

fn assertion_validation(alg: Algorithm) -> Validation {
    let mut validation = Validation::new(alg);
    validation.leeway = DEFAULT_JWT_LEEWAY;
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    validation
}

fn iat_fresh(iat: i64, ct: Duration) -> bool {
    let now = ct.as_secs() as i64;
    iat <= now + DEFAULT_JWT_LEEWAY as i64
        && iat >= now - DEVICE_ASSERTION_MAX_AGE_SECONDS as i64
}

/// Fresh P-256 pair as a JWK with the private scalar, for the device side.
fn generate_p256_jwk() -> Result<EcJwk, OperationError> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
        .map_err(|_| OperationError::CryptographyError)?;
    let key = EcKey::generate(&group).map_err(|err| {
        admin_error!(?err, "EC key generation failed");
        OperationError::CryptographyError
    })?;
    let mut ctx = BigNumContext::new().map_err(|_| OperationError::CryptographyError)?;
    let mut x = BigNum::new().map_err(|_| OperationError::CryptographyError)?;
    let mut y = BigNum::new().map_err(|_| OperationError::CryptographyError)?;
    key.public_key()
        .affine_coordinates(&group, &mut x, &mut y, &mut ctx)
        .map_err(|_| OperationError::CryptographyError)?;
    let pad = |bn: &openssl::bn::BigNumRef| -> Result<String, OperationError> {
        bn.to_vec_padded(32)
            .map(|bytes| URL_SAFE_NO_PAD.encode(bytes))
            .map_err(|_| OperationError::CryptographyError)
    };
    Ok(EcJwk {
        kty: "EC".to_string(),
        crv: "P-256".to_string(),
        x: pad(&x)?,
        y: pad(&y)?,
        d: Some(pad(key.private_key())?),
    })
}

// == storage ==

type RawDevice = (String, String, String, String, i64, Option<i64>);

fn row_to_device(row: &rusqlite::Row) -> rusqlite::Result<RawDevice> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn finish_device(parts: RawDevice) -> Result<UserDevice, OperationError> {
    let (id, user_uuid, public_key, secret_key, auth_counter, last_used_at) = parts;
    Ok(UserDevice {
        id: Uuid::parse_str(&id).map_err(|_| OperationError::InvalidState)?,
        user_uuid: Uuid::parse_str(&user_uuid).map_err(|_| OperationError::InvalidState)?,
        public_key: from_json_text(&public_key)?,
        secret_key: from_json_text(&secret_key)?,
        auth_counter,
        last_used_at,
    })
}

const DEVICE_COLS: &str = "id, user_uuid, public_key, secret_key, auth_counter, last_used_at";

pub(crate) fn device_insert(txn: &Transaction, device: &UserDevice) -> Result<(), OperationError> {
    txn.execute(
        "INSERT INTO user_devices (id, user_uuid, public_key, secret_key, auth_counter, last_used_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            device.id.to_string(),
            device.user_uuid.to_string(),
            to_json_text(&device.public_key)?,
            to_json_text(&device.secret_key)?,
            device.auth_counter,
            device.last_used_at,
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

pub(crate) fn device_get(
    txn: &Transaction,
    id: Uuid,
) -> Result<Option<UserDevice>, OperationError> {
    let maybe = txn
        .query_row(
            &format!("SELECT {DEVICE_COLS} FROM user_devices WHERE id = ?1"),
            params![id.to_string()],
            row_to_device,
        )
        .optional()
        .map_err(sqlite_err)?;
    maybe.map(finish_device).transpose()
}

pub(crate) fn devices_for_user(
    txn: &Transaction,
    user_uuid: Uuid,
) -> Result<Vec<UserDevice>, OperationError> {
    let mut stmt = txn
        .prepare(&format!(
            "SELECT {DEVICE_COLS} FROM user_devices WHERE user_uuid = ?1 ORDER BY id"
        ))
        .map_err(sqlite_err)?;
    let parts = stmt
        .query_map(params![user_uuid.to_string()], row_to_device)
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    parts.into_iter().map(finish_device).collect()
}

pub(crate) fn device_delete(txn: &Transaction, id: Uuid) -> Result<(), OperationError> {
    txn.execute(
        "DELETE FROM user_devices WHERE id = ?1",
        params![id.to_string()],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

fn device_touch(txn: &Transaction, device: &UserDevice) -> Result<(), OperationError> {
    txn.execute(
        "UPDATE user_devices SET auth_counter = ?1, last_used_at = ?2 WHERE id = ?3",
        params![
            device.auth_counter,
            device.last_used_at,
            device.id.to_string()
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

pub(crate) fn interface_device_insert(
    txn: &Transaction,
    device: &InterfaceDevice,
) -> Result<(), OperationError> {
    let scopes = device
        .scopes
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join(" ");
    txn.execute(
        "INSERT INTO interface_devices (id, secret_key, scopes) VALUES (?1, ?2, ?3)",
        params![device.id.to_string(), device.secret_key, scopes],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

pub(crate) fn interface_device_get(
    txn: &Transaction,
    id: Uuid,
) -> Result<Option<InterfaceDevice>, OperationError> {
    txn.query_row(
        "SELECT id, secret_key, scopes FROM interface_devices WHERE id = ?1",
        params![id.to_string()],
        |row| {
            let id: String = row.get(0)?;
            let scopes: String = row.get(2)?;
            Ok((id, row.get::<_, String>(1)?, scopes))
        },
    )
    .optional()
    .map_err(sqlite_err)?
    .map(|(id, secret_key, scopes)| {
        Ok(InterfaceDevice {
            id: Uuid::parse_str(&id).map_err(|_| OperationError::InvalidState)?,
            secret_key,
            scopes: scopes.split_whitespace().map(str::to_string).collect(),
        })
    })
    .transpose()
}

pub(crate) fn identity_upsert(
    txn: &Transaction,
    identity: &UserIdentity,
) -> Result<(), OperationError> {
    txn.execute(
        "INSERT INTO user_identities (id, user_uuid, service, identifier, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (user_uuid, service) DO UPDATE SET
            identifier = excluded.identifier",
        params![
            identity.id.to_string(),
            identity.user_uuid.to_string(),
            identity.service,
            identity.identifier,
            identity.created_at,
        ],
    )
    .map_err(sqlite_err)?;
    Ok(())
}

pub(crate) fn identities_for_user(
    txn: &Transaction,
    user_uuid: Uuid,
) -> Result<Vec<UserIdentity>, OperationError> {
    let mut stmt = txn
        .prepare(
            "SELECT id, user_uuid, service, identifier, created_at FROM user_identities
             WHERE user_uuid = ?1 ORDER BY service",
        )
        .map_err(sqlite_err)?;
    let rows = stmt
        .query_map(params![user_uuid.to_string()], |row| {
            let id: String = row.get(0)?;
            let user_uuid: String = row.get(1)?;
            Ok(UserIdentity {
                id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
                user_uuid: Uuid::parse_str(&user_uuid).unwrap_or_else(|_| Uuid::nil()),
                service: row.get(2)?,
                identifier: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idm::oauth2::{self, IssuedToken};
    use crate::idm::server::test_support::test_idms;
    use crate::idm::session::{self, ElementKind, SessionData};
    use crate::idm::users::{user_upsert, User};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use openssl::pkey::PKey;

    const T0: Duration = Duration::from_secs(1_700_000_000);

    /// A device-side P-256 key: the signing pem and the public JWK the
    /// device would register.
    fn device_keypair() -> (Vec<u8>, EcJwk) {
        let jwk = generate_p256_jwk().expect("keygen failed");
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).expect("group");
        let d = BigNum::from_slice(
            &URL_SAFE_NO_PAD
                .decode(jwk.d.as_deref().expect("private half missing"))
                .expect("bad d"),
        )
        .expect("bignum");
        let x = BigNum::from_slice(&URL_SAFE_NO_PAD.decode(&jwk.x).expect("bad x"))
            .expect("bignum");
        let y = BigNum::from_slice(&URL_SAFE_NO_PAD.decode(&jwk.y).expect("bad y"))
            .expect("bignum");
        let mut ctx = BigNumContext::new().expect("ctx");
        let mut point = openssl::ec::EcPoint::new(&group).expect("point");
        point
            .set_affine_coordinates_gfp(&group, &x, &y, &mut ctx)
            .expect("affine");
        let key = EcKey::from_private_components(&group, &d, &point).expect("eckey");
        let pem = PKey::from_ec_key(key)
            .expect("pkey")
            .private_key_to_pem_pkcs8()
            .expect("pem");
        (pem, jwk.public())
    }

    fn sign_assertion(pem: &[u8], claims: &DeviceAssertionClaims) -> String {
        encode(
            &Header::new(Algorithm::ES256),
            claims,
            &EncodingKey::from_ec_pem(pem).expect("encoding key"),
        )
        .expect("sign failed")
    }

    async fn seed_bearer(idms: &IdmServer, scope: &str) -> (Uuid, String) {
        let scope = scope.to_string();
        idms.db
            .with_write(move |txn| {
                let user = User::new(Uuid::new_v4());
                user_upsert(txn, &user, T0)?;
                let session = session::session_create(txn, user.uuid, &SessionData::default(), T0)?;
                let token = IssuedToken {
                    id: Uuid::new_v4(),
                    access_token: crate::utils::generate_opaque_token(),
                    refresh_token: None,
                    user_uuid: user.uuid,
                    client_id: "app".to_string(),
                    scope: [OAUTH2_SCOPE_OPENID.to_string(), scope.clone()]
                        .into_iter()
                        .collect(),
                    id_token: None,
                    nonce: None,
                    created_at: T0.as_secs() as i64,
                    expires_at: (T0.as_secs() + 3600) as i64,
                };
                oauth2::token_insert(txn, &token)?;
                session::element_add(txn, session.id, ElementKind::Token, &token.id.to_string(), T0)?;
                Ok((user.uuid, token.access_token))
            })
            .await
            .expect("seed failed")
    }

    #[tokio::test]
    async fn test_device_registration_and_assertion() {
        let idms = test_idms().await;
        idms.db
            .with_write(|txn| {
                crate::idm::clients::client_upsert(
                    txn,
                    &crate::idm::server::test_support::test_client("app", "https://t/cb"),
                )
            })
            .await
            .expect("client seed failed");
        let (user_uuid, bearer) = seed_bearer(&idms, OAUTH2_SCOPE_DEVICES).await;

        let (pem, public_jwk) = device_keypair();
        let device = idms
            .device_register(&bearer, &public_jwk, T0)
            .await
            .expect("registration failed");
        assert_eq!(device.user_uuid, user_uuid);
        assert!(device.secret_key.d.is_some());
        assert!(device.public_key.d.is_none());

        // First assertion advances the counter.
        let assertion = sign_assertion(
            &pem,
            &DeviceAssertionClaims {
                iat: T0.as_secs() as i64,
                counter: 1,
                nonce: Some("n-1".to_string()),
            },
        );
        let authed = idms
            .device_authenticate(device.id, &assertion, T0)
            .await
            .expect("assertion failed");
        assert_eq!(authed.auth_counter, 1);
        assert_eq!(authed.last_used_at, Some(T0.as_secs() as i64));

        // Replaying the same counter is refused.
        let out = idms.device_authenticate(device.id, &assertion, T0).await;
        assert_eq!(out.err(), Some(OperationError::AccessDenied));

        // A different device key never verifies.
        let (other_pem, _) = device_keypair();
        let forged = sign_assertion(
            &other_pem,
            &DeviceAssertionClaims {
                iat: T0.as_secs() as i64,
                counter: 5,
                nonce: None,
            },
        );
        let out = idms.device_authenticate(device.id, &forged, T0).await;
        assert_eq!(out.err(), Some(OperationError::AccessDenied));

        // Stale assertion is refused even with a fresh counter.
        let stale = sign_assertion(
            &pem,
            &DeviceAssertionClaims {
                iat: T0.as_secs() as i64 - 3600,
                counter: 7,
                nonce: None,
            },
        );
        let out = idms.device_authenticate(device.id, &stale, T0).await;
        assert_eq!(out.err(), Some(OperationError::AccessDenied));
    }

    #[tokio::test]
    async fn test_device_scope_and_ownership() {
        let idms = test_idms().await;
        idms.db
            .with_write(|txn| {
                crate::idm::clients::client_upsert(
                    txn,
                    &crate::idm::server::test_support::test_client("app", "https://t/cb"),
                )
            })
            .await
            .expect("client seed failed");

        // A token without the devices scope cannot register.
        let (_, plain_bearer) = seed_bearer(&idms, OAUTH2_SCOPE_PROFILE).await;
        let (_, public_jwk) = device_keypair();
        let out = idms.device_register(&plain_bearer, &public_jwk, T0).await;
        assert!(matches!(out, Err(Oauth2Error::InvalidToken)));

        // Another user cannot delete a device they do not own.
        let (_, owner_bearer) = seed_bearer(&idms, OAUTH2_SCOPE_DEVICES).await;
        let (_, other_bearer) = seed_bearer(&idms, OAUTH2_SCOPE_DEVICES).await;
        let device = idms
            .device_register(&owner_bearer, &public_jwk, T0)
            .await
            .expect("registration failed");
        let out = idms.device_delete(&other_bearer, device.id, T0).await;
        assert!(matches!(out, Err(Oauth2Error::InvalidRequest)));
        idms.device_delete(&owner_bearer, device.id, T0)
            .await
            .expect("delete failed");
        let listed = idms
            .device_list(&owner_bearer, T0)
            .await
            .expect("list failed");
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_interface_device_assertion() {
        let idms = test_idms().await;
        let device = idms
            .interface_device_create(["helerm.read".to_string()].into_iter().collect())
            .await
            .expect("create failed");

        let assertion = codec::hs_sign(
            Algorithm::HS256,
            device.secret_key.as_bytes(),
            &InterfaceAssertionClaims {
                iat: T0.as_secs() as i64,
            },
        )
        .expect("sign failed");
        let scopes = idms
            .interface_device_authenticate(device.id, &assertion, T0)
            .await
            .expect("assertion failed");
        assert!(scopes.contains("helerm.read"));

        let forged = codec::hs_sign(
            Algorithm::HS256,
            b"wrong-secret",
            &InterfaceAssertionClaims {
                iat: T0.as_secs() as i64,
            },
        )
        .expect("sign failed");
        let out = idms
            .interface_device_authenticate(device.id, &forged, T0)
            .await;
        assert_eq!(out.err(), Some(OperationError::AccessDenied));
    }

    #[tokio::test]
    async fn test_identity_link_requires_configured_validator() {
        let idms = test_idms().await;
        idms.db
            .with_write(|txn| {
                crate::idm::clients::client_upsert(
                    txn,
                    &crate::idm::server::test_support::test_client("app", "https://t/cb"),
                )
            })
            .await
            .expect("client seed failed");
        let (user_uuid, bearer) = seed_bearer(&idms, OAUTH2_SCOPE_IDENTITIES).await;

        // No validator configured for the service.
        let out = idms
            .identity_link(&bearer, "helmet", "23500012345678", "1234", T0)
            .await;
        assert_eq!(out.err(), Some(IdentityLinkError::NotImplemented));

        // A bad bearer token fails before any validator lookup.
        let out = idms
            .identity_link("nonsense", "helmet", "23500012345678", "1234", T0)
            .await;
        assert_eq!(out.err(), Some(IdentityLinkError::InvalidToken));

        // Storage upsert replaces the identifier for the same service.
        idms.db
            .with_write(move |txn| {
                let first = UserIdentity {
                    id: Uuid::new_v4(),
                    user_uuid,
                    service: "helmet".to_string(),
                    identifier: "23500012345678".to_string(),
                    created_at: T0.as_secs() as i64,
                };
                identity_upsert(txn, &first)?;
                let second = UserIdentity {
                    identifier: "23500099999999".to_string(),
                    ..first.clone()
                };
                identity_upsert(txn, &second)?;
                let listed = identities_for_user(txn, user_uuid)?;
                assert_eq!(listed.len(), 1);
                assert_eq!(listed[0].identifier, "23500099999999");
                Ok(())
            })
            .await
            .expect("upsert failed");
    }
}
