//! The Tunnistamo server backend library. This contains the IDM core of the
//! identity provider: storage, the signing key lifecycle, the token codec,
//! client and API registries, Tunnistamo sessions, the upstream login
//! adapters and pipeline, the OAuth2/OIDC authorisation server, the API
//! token service and the logout service.
//!
//! The HTTP layer in `tunnistamod_core` drives this library; nothing in here
//! knows about axum or request framing.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

#[macro_use]
extern crate sketching;

pub mod be;
pub mod idm;
pub mod prelude;
pub mod utils;
