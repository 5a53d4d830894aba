//! RSA signing key lifecycle.
//!
//! The newest unexpired key signs all outgoing tokens. Rotation adopts any
//! imported key it has not seen before by expiring it immediately, then
//! guarantees a fresh enough signing key exists, then expires managed keys
//! past their maximum age. Expired keys stay available for verification for
//! a retention window so tokens signed just before rotation keep validating,
//! and are purged after that. Running rotation twice at the same instant is
//! a no-op the second time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use openssl::bn::BigNumRef;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sha;
use rusqlite::{params, OptionalExtension, Transaction};

use crate::be::sqlite_err;
use crate::prelude::*;

use tunnistamo_proto::jwk::{Jwk, JwkKeySet};

#[derive(Debug, Clone)]
pub struct RsaKeyRecord {
    pub kid: String,
    pub pem: String,
    pub created_at: i64,
    pub expired_at: Option<i64>,
    /// Managed keys are rotated and purged automatically. Imported keys
    /// start unmanaged and are adopted (expired) by the next rotation.
    pub managed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyConfig {
    pub bits: u32,
    pub max_age: Duration,
    pub retention: Duration,
}

impl Default for KeyConfig {
    fn default() -> Self {
        KeyConfig {
            bits: DEFAULT_KEY_LENGTH_BITS,
            max_age: Duration::from_secs(DEFAULT_KEY_MAX_AGE_SECONDS),
            retention: Duration::from_secs(DEFAULT_KEY_EXPIRATION_PERIOD_SECONDS),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RotationOutcome {
    pub generated: Option<String>,
    pub expired: Vec<String>,
    pub purged: Vec<String>,
}

impl RotationOutcome {
    pub fn is_noop(&self) -> bool {
        self.generated.is_none() && self.expired.is_empty() && self.purged.is_empty()
    }
}

/// Key id from the sha256 of the public key der, truncated.
fn derive_kid(pkey: &PKey<Private>) -> Result<String, OperationError> {
    let der = pkey.public_key_to_der().map_err(|err| {
        admin_error!(?err, "Unable to serialise public key");
        OperationError::CryptographyError
    })?;
    let digest = sha::sha256(&der);
    Ok(hex_lower(&digest[..8]))
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn b64_bn(bn: &BigNumRef) -> String {
    URL_SAFE_NO_PAD.encode(bn.to_vec())
}

#[cfg(test)]
pub(crate) fn key_load(
    txn: &Transaction,
    kid: &str,
) -> Result<Option<RsaKeyRecord>, OperationError> {
    txn.query_row(
        "SELECT kid, pem, created_at, expired_at, managed FROM rsa_keys WHERE kid = ?1",
        params![kid],
        row_to_key,
    )
    .optional()
    .map_err(sqlite_err)
}

fn row_to_key(row: &rusqlite::Row) -> rusqlite::Result<RsaKeyRecord> {
    Ok(RsaKeyRecord {
        kid: row.get(0)?,
        pem: row.get(1)?,
        created_at: row.get(2)?,
        expired_at: row.get(3)?,
        managed: row.get::<_, i64>(4)? != 0,
    })
}

pub(crate) fn keys_all(txn: &Transaction) -> Result<Vec<RsaKeyRecord>, OperationError> {
    let mut stmt = txn
        .prepare(
            "SELECT kid, pem, created_at, expired_at, managed FROM rsa_keys
             ORDER BY created_at DESC, kid ASC",
        )
        .map_err(sqlite_err)?;
    let keys = stmt
        .query_map([], row_to_key)
        .map_err(sqlite_err)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sqlite_err)?;
    Ok(keys)
}

/// Generate and store a new managed signing key. Returns the new kid.
pub(crate) fn key_generate(
    txn: &Transaction,
    ct: Duration,
    bits: u32,
) -> Result<String, OperationError> {
    let rsa = Rsa::generate(bits).map_err(|err| {
        admin_error!(?err, "rsa keygen failed");
        OperationError::CryptographyError
    })?;
    let pkey = PKey::from_rsa(rsa).map_err(|err| {
        admin_error!(?err, "rsa keygen failed");
        OperationError::CryptographyError
    })?;
    let kid = derive_kid(&pkey)?;
    let pem = pkey
        .private_key_to_pem_pkcs8()
        .map_err(|err| {
            admin_error!(?err, "Unable to serialise private key");
            OperationError::CryptographyError
        })
        .and_then(|bytes| {
            String::from_utf8(bytes).map_err(|_| OperationError::CryptographyError)
        })?;

    txn.execute(
        "INSERT INTO rsa_keys (kid, pem, created_at, expired_at, managed)
         VALUES (?1, ?2, ?3, NULL, 1)",
        params![kid, pem, ct.as_secs() as i64],
    )
    .map_err(sqlite_err)?;
    security_info!(%kid, "Generated new rsa signing key");
    Ok(kid)
}

/// Import an externally produced private key. The key is stored unmanaged
/// and the next rotation adopts it, expiring it for signing.
pub(crate) fn key_import(
    txn: &Transaction,
    ct: Duration,
    pem: &str,
) -> Result<String, OperationError> {
    let pkey = PKey::private_key_from_pem(pem.as_bytes()).map_err(|err| {
        admin_error!(?err, "Unable to parse imported private key");
        OperationError::CryptographyError
    })?;
    let kid = derive_kid(&pkey)?;
    txn.execute(
        "INSERT INTO rsa_keys (kid, pem, created_at, expired_at, managed)
         VALUES (?1, ?2, ?3, NULL, 0)
         ON CONFLICT (kid) DO NOTHING",
        params![kid, pem, ct.as_secs() as i64],
    )
    .map_err(sqlite_err)?;
    Ok(kid)
}

/// The key that signs new tokens: newest unexpired key.
pub(crate) fn active_signing_key(
    txn: &Transaction,
) -> Result<Option<RsaKeyRecord>, OperationError> {
    txn.query_row(
        "SELECT kid, pem, created_at, expired_at, managed FROM rsa_keys
         WHERE expired_at IS NULL ORDER BY created_at DESC, kid ASC LIMIT 1",
        [],
        row_to_key,
    )
    .optional()
    .map_err(sqlite_err)
}

/// Keys valid for verification: every unexpired key plus expired keys still
/// inside the retention window.
pub(crate) fn verification_keys(
    txn: &Transaction,
    ct: Duration,
    cfg: &KeyConfig,
) -> Result<Vec<RsaKeyRecord>, OperationError> {
    let horizon = ct.as_secs() as i64 - cfg.retention.as_secs() as i64;
    Ok(keys_all(txn)?
        .into_iter()
        .filter(|k| match k.expired_at {
            None => true,
            Some(exp) => exp > horizon,
        })
        .collect())
}

/// Advance the key lifecycle to the current time.
pub(crate) fn key_rotate(
    txn: &Transaction,
    ct: Duration,
    cfg: &KeyConfig,
) -> Result<RotationOutcome, OperationError> {
    let now = ct.as_secs() as i64;
    let stale_before = now - cfg.max_age.as_secs() as i64;
    let mut outcome = RotationOutcome::default();

    // Adopt unmanaged keys: a key of unknown origin must never sign new
    // tokens, so it is expired on sight and rides out the retention window
    // as a verification-only key.
    for key in keys_all(txn)? {
        if !key.managed && key.expired_at.is_none() {
            txn.execute(
                "UPDATE rsa_keys SET expired_at = ?1, managed = 1 WHERE kid = ?2",
                params![now, key.kid],
            )
            .map_err(sqlite_err)?;
            security_info!(kid = %key.kid, "Adopted unmanaged rsa key, expiring it");
            outcome.expired.push(key.kid);
        }
    }

    // Purge expired keys past retention.
    let purge_before = now - cfg.retention.as_secs() as i64;
    for key in keys_all(txn)? {
        if key.expired_at.map(|e| e <= purge_before).unwrap_or(false) {
            txn.execute("DELETE FROM rsa_keys WHERE kid = ?1", params![key.kid])
                .map_err(sqlite_err)?;
            security_info!(kid = %key.kid, "Purged retired rsa key");
            outcome.purged.push(key.kid);
        }
    }

    // Ensure a fresh signing key before expiring anything, so signing never
    // observes an empty set.
    let needs_new = match active_signing_key(txn)? {
        Some(key) => key.created_at <= stale_before,
        None => true,
    };
    if needs_new {
        outcome.generated = Some(key_generate(txn, ct, cfg.bits)?);
    }

    // Expire managed keys past max age, except the active signing key.
    let active_kid = active_signing_key(txn)?.map(|k| k.kid);
    for key in keys_all(txn)? {
        if key.managed
            && key.expired_at.is_none()
            && key.created_at <= stale_before
            && Some(&key.kid) != active_kid.as_ref()
        {
            txn.execute(
                "UPDATE rsa_keys SET expired_at = ?1 WHERE kid = ?2",
                params![now, key.kid],
            )
            .map_err(sqlite_err)?;
            security_info!(kid = %key.kid, "Expired rsa signing key");
            outcome.expired.push(key.kid);
        }
    }

    Ok(outcome)
}

/// The public JWKS document over the verification keys.
pub(crate) fn jwks(
    txn: &Transaction,
    ct: Duration,
    cfg: &KeyConfig,
) -> Result<JwkKeySet, OperationError> {
    let keys = verification_keys(txn, ct, cfg)?
        .into_iter()
        .map(|record| {
            let pkey = PKey::private_key_from_pem(record.pem.as_bytes()).map_err(|err| {
                admin_error!(?err, kid = %record.kid, "Stored rsa key does not parse");
                OperationError::CryptographyError
            })?;
            let rsa = pkey.rsa().map_err(|_| OperationError::CryptographyError)?;
            Ok(Jwk::rsa_sig(record.kid, b64_bn(rsa.n()), b64_bn(rsa.e())))
        })
        .collect::<Result<Vec<_>, OperationError>>()?;
    Ok(JwkKeySet { keys })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::be::Db;

    const TEST_KEY_BITS: u32 = 2048;

    fn test_cfg() -> KeyConfig {
        KeyConfig {
            bits: TEST_KEY_BITS,
            max_age: Duration::from_secs(90 * 86400),
            retention: Duration::from_secs(7 * 86400),
        }
    }

    #[tokio::test]
    async fn test_rotation_lifecycle() {
        let db = Db::new(":memory:").expect("failed to open db");
        let cfg = test_cfg();
        let t0 = Duration::from_secs(1_000_000);

        // Empty store: first rotation generates the initial key.
        let outcome = db
            .with_write(move |txn| key_rotate(txn, t0, &cfg))
            .await
            .expect("rotate failed");
        let kid0 = outcome.generated.clone().expect("no key generated");
        assert!(outcome.expired.is_empty());

        // Immediate re-run is a no-op.
        let outcome = db
            .with_write(move |txn| key_rotate(txn, t0, &cfg))
            .await
            .expect("rotate failed");
        assert!(outcome.is_noop());

        // Past max age: a new key is generated and the old one expires.
        let t1 = t0 + cfg.max_age + Duration::from_secs(1);
        let outcome = db
            .with_write(move |txn| key_rotate(txn, t1, &cfg))
            .await
            .expect("rotate failed");
        let kid1 = outcome.generated.clone().expect("no replacement generated");
        assert_ne!(kid0, kid1);
        assert_eq!(outcome.expired, vec![kid0.clone()]);

        // The expired key still verifies inside the retention window.
        let kid0_q = kid0.clone();
        let keys = db
            .with_read(move |txn| verification_keys(txn, t1, &cfg))
            .await
            .expect("read failed");
        assert!(keys.iter().any(|k| k.kid == kid0_q));
        let active = db
            .with_read(active_signing_key)
            .await
            .expect("read failed")
            .expect("no active key");
        assert_eq!(active.kid, kid1);

        // Past retention the expired key is purged.
        let t2 = t1 + cfg.retention + Duration::from_secs(1);
        let outcome = db
            .with_write(move |txn| key_rotate(txn, t2, &cfg))
            .await
            .expect("rotate failed");
        assert_eq!(outcome.purged, vec![kid0.clone()]);
        let keys = db
            .with_read(move |txn| jwks(txn, t2, &cfg))
            .await
            .expect("read failed");
        assert!(keys.key_by_kid(&kid0).is_none());
        assert!(keys.key_by_kid(&kid1).is_some());
    }

    #[tokio::test]
    async fn test_imported_key_adopted_on_rotation() {
        let db = Db::new(":memory:").expect("failed to open db");
        let cfg = test_cfg();
        let t0 = Duration::from_secs(1_000_000);

        let pem = {
            let rsa = Rsa::generate(TEST_KEY_BITS).expect("keygen failed");
            let pkey = PKey::from_rsa(rsa).expect("pkey failed");
            String::from_utf8(pkey.private_key_to_pem_pkcs8().expect("pem failed"))
                .expect("utf8 failed")
        };
        let pem_q = pem.clone();
        let kid = db
            .with_write(move |txn| key_import(txn, t0, &pem_q))
            .await
            .expect("import failed");

        // Rotation expires the imported key on sight and generates a
        // managed replacement that takes over signing.
        let kid_q = kid.clone();
        let outcome = db
            .with_write(move |txn| key_rotate(txn, t0, &cfg))
            .await
            .expect("rotate failed");
        assert_eq!(outcome.expired, vec![kid.clone()]);
        let generated = outcome.generated.expect("no replacement generated");
        assert_ne!(generated, kid);

        let record = db
            .with_read(move |txn| key_load(txn, &kid_q))
            .await
            .expect("read failed")
            .expect("imported key missing");
        assert!(record.expired_at.is_some());
        assert!(record.managed);

        let active = db
            .with_read(active_signing_key)
            .await
            .expect("read failed")
            .expect("no active key");
        assert_eq!(active.kid, generated);

        // Inside retention the imported key still verifies, after it is
        // purged like any other retired key.
        let kid_q = kid.clone();
        let keys = db
            .with_read(move |txn| verification_keys(txn, t0, &cfg))
            .await
            .expect("read failed");
        assert!(keys.iter().any(|k| k.kid == kid_q));

        let t1 = t0 + cfg.retention + Duration::from_secs(1);
        let outcome = db
            .with_write(move |txn| key_rotate(txn, t1, &cfg))
            .await
            .expect("rotate failed");
        assert!(outcome.purged.contains(&kid));
    }
}
