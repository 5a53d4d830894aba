//! The IDM layer - identity management components. All externally usable
//! operations hang off [`server::IdmServer`]; the modules here each own one
//! aggregate of the provider and its storage.

pub mod apis;
pub mod apitoken;
pub mod clients;
pub mod codec;
pub mod consent;
pub mod device;
pub mod keys;
pub mod logout;
pub mod oauth2;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod upstream;
pub mod users;
pub mod websession;
