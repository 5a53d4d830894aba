//! Tunnistamo protocol definitions.
//!
//! The wire-visible types of the authorisation server: OAuth2 / OIDC request
//! and response bodies, the JWK document, logout tokens, and the operation
//! error enum shared between the IDM core and the HTTP layer.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod constants;
pub mod error;
pub mod jwk;
pub mod oauth2;
pub mod oidc;

pub use self::error::OperationError;
