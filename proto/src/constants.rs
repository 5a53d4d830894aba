//! Constants shared across the server and its protocol surface.

pub const APPLICATION_JSON: &str = "application/json";
pub const APPLICATION_FORM: &str = "application/x-www-form-urlencoded";

// Cookies. The web session is the browser-facing session, distinct from the
// Tunnistamo session aggregate which binds issued artifacts together.
pub const COOKIE_SESSION: &str = "sso-sessionid";
pub const COOKIE_CSRF: &str = "sso-csrftoken";

// Standard OIDC scopes.
pub const OAUTH2_SCOPE_OPENID: &str = "openid";
pub const OAUTH2_SCOPE_PROFILE: &str = "profile";
pub const OAUTH2_SCOPE_EMAIL: &str = "email";
pub const OAUTH2_SCOPE_ADDRESS: &str = "address";
pub const OAUTH2_SCOPE_PHONE: &str = "phone";

// Tunnistamo specific scopes.
pub const OAUTH2_SCOPE_AD_GROUPS: &str = "ad_groups";
pub const OAUTH2_SCOPE_GITHUB_USERNAME: &str = "github_username";
pub const OAUTH2_SCOPE_LOGIN_ENTRIES: &str = "login_entries";
pub const OAUTH2_SCOPE_CONSENTS: &str = "consents";
pub const OAUTH2_SCOPE_IDENTITIES: &str = "identities";
pub const OAUTH2_SCOPE_DEVICES: &str = "devices";

// Non-standard claims carried in ID tokens and API tokens, but never in
// the userinfo document.
pub const CLAIM_LOA: &str = "loa";
pub const CLAIM_AZP: &str = "azp";
pub const CLAIM_AMR: &str = "amr";
pub const CLAIM_SID: &str = "sid";

pub const LOA_LOW: &str = "low";
pub const LOA_SUBSTANTIAL: &str = "substantial";
pub const LOA_HIGH: &str = "high";

/// The event URI that must be present in an OIDC back-channel logout token.
pub const BACKCHANNEL_LOGOUT_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

// Endpoint paths. These are also the CORS path allow-list inputs.
pub mod uri {
    pub const OIDC_DISCOVERY: &str = "/.well-known/openid-configuration";
    pub const OIDC_JWKS: &str = "/openid/jwks";
    pub const OAUTH2_AUTHORISE: &str = "/openid/authorize";
    pub const OAUTH2_TOKEN: &str = "/openid/token";
    pub const OIDC_USERINFO: &str = "/openid/userinfo";
    pub const OAUTH2_INTROSPECT: &str = "/openid/introspect";
    pub const OIDC_END_SESSION: &str = "/openid/end-session";
    pub const API_TOKENS: &str = "/api-tokens";
    pub const JWT_TOKEN: &str = "/jwt-token";
    pub const LOGIN: &str = "/login";
    pub const LOGOUT: &str = "/logout";
}

/// Default leeway in seconds for JWT time claim validation.
pub const DEFAULT_JWT_LEEWAY: u64 = 10;

/// Default authorization code validity in seconds.
pub const DEFAULT_CODE_EXPIRY_SECONDS: u64 = 600;

/// Default access token validity in seconds.
pub const DEFAULT_TOKEN_EXPIRY_SECONDS: u64 = 3600;

/// Default ID token validity in seconds.
pub const DEFAULT_ID_TOKEN_EXPIRY_SECONDS: u64 = 600;

/// How long an upstream OIDC discovery document is cached, in seconds.
pub const DISCOVERY_CACHE_TTL_SECONDS: u64 = 86_400;

/// Maximum accepted age of an upstream back-channel logout token, in seconds.
pub const LOGOUT_TOKEN_MAX_AGE_SECONDS: u64 = 600;

/// Timeout for back-channel logout fan-out POSTs, in seconds.
pub const BACKCHANNEL_POST_TIMEOUT_SECONDS: u64 = 2;

// Key lifecycle defaults, see the key manager.
pub const DEFAULT_KEY_MAX_AGE_SECONDS: u64 = 90 * 86_400;
pub const DEFAULT_KEY_EXPIRATION_PERIOD_SECONDS: u64 = 7 * 86_400;
pub const DEFAULT_KEY_LENGTH_BITS: u32 = 4096;
