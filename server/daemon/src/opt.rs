#[derive(Debug, Args)]
struct CommonOpt {
    /// Path to the server's configuration file.
    #[clap(
        short,
        long = "config",
        env = "TUNNISTAMO_CONFIG",
        default_value = "/etc/tunnistamo/server.toml"
    )]
    config_path: PathBuf,
}

#[derive(Debug, Args)]
struct CreateClientOpt {
    #[clap(flatten)]
    commonopts: CommonOpt,
    /// The oauth2 client_id to register.
    client_id: String,
    /// Human readable name shown on the consent view.
    #[clap(long, default_value = "")]
    name: String,
    /// Registered redirect uris, exact match at authorise time.
    #[clap(long = "redirect-uri", required = true)]
    redirect_uris: Vec<Url>,
    /// Registered post logout redirect uris.
    #[clap(long = "post-logout-redirect-uri")]
    post_logout_redirect_uris: Vec<Url>,
    /// `public` or `confidential`.
    #[clap(long, default_value = "confidential")]
    client_type: String,
    /// Allowed response types, e.g. `code` or `id_token token`.
    #[clap(long = "response-type", default_values_t = vec!["code".to_string()])]
    response_types: Vec<String>,
    /// Restrict login to these upstream providers. Empty allows all.
    #[clap(long = "login-method")]
    login_methods: Vec<String>,
    /// Require per-user consent before issuing artifacts.
    #[clap(long, action)]
    require_consent: bool,
}

#[derive(Debug, Args)]
struct CreateApiOpt {
    #[clap(flatten)]
    commonopts: CommonOpt,
    /// The api domain, e.g. `https://api.example.com/auth`.
    domain: String,
    /// The api name under the domain.
    name: String,
    /// Scopes a caller must hold before api tokens are minted. Defaults to
    /// the api identifier.
    #[clap(long = "required-scope")]
    required_scopes: Vec<String>,
    /// Client registration the api uses for back-channel logout audience.
    #[clap(long)]
    oidc_client_id: Option<String>,
    /// Url the api receives back-channel logout tokens at.
    #[clap(long)]
    backchannel_logout_url: Option<Url>,
}

#[derive(Debug, Args)]
struct CreateApiScopeOpt {
    #[clap(flatten)]
    commonopts: CommonOpt,
    /// The api domain.
    domain: String,
    /// The api name under the domain.
    name: String,
    /// Optional specifier appended as `.specifier` to the scope identifier.
    #[clap(long)]
    specifier: Option<String>,
    /// English display name for the consent view.
    #[clap(long = "display-name", default_value = "")]
    display_name: String,
}

#[derive(Debug, Args)]
struct AddScopeClientOpt {
    #[clap(flatten)]
    commonopts: CommonOpt,
    /// The api scope identifier, e.g. `https://api.example.com/auth/foo.read`.
    scope_identifier: String,
    /// The client allowed to request the scope.
    client_id: String,
}

#[derive(Debug, Args)]
struct ImportKeyOpt {
    #[clap(flatten)]
    commonopts: CommonOpt,
    /// Path to a pem encoded rsa private key. The imported key verifies
    /// existing tokens and is expired for signing by the next rotation.
    key_path: PathBuf,
}

#[derive(Debug, Args)]
struct RecoverClientOpt {
    #[clap(flatten)]
    commonopts: CommonOpt,
    /// The client to issue a fresh secret for.
    client_id: String,
}

#[derive(Debug, Subcommand)]
enum TunnistamodOpt {
    /// Start the server in the foreground.
    Server(CommonOpt),
    /// Run the signing key rotation once and report what changed.
    RotateKeys(CommonOpt),
    /// Import an existing rsa private key for token verification.
    ImportKey(ImportKeyOpt),
    /// Register an oauth2/oidc client. Prints the generated secret once.
    CreateClient(CreateClientOpt),
    /// Register an api under its domain.
    CreateApi(CreateApiOpt),
    /// Register an api scope for an existing api.
    CreateApiScope(CreateApiScopeOpt),
    /// Allow a client to request a restricted api scope.
    AddScopeClient(AddScopeClientOpt),
    /// Regenerate a client's secret. Prints the new secret once.
    RecoverClientSecret(RecoverClientOpt),
}

#[derive(Debug, Parser)]
#[clap(
    name = "tunnistamod",
    about = "Tunnistamo identity provider daemon and administration tool"
)]
struct TunnistamodParser {
    #[clap(subcommand)]
    commands: TunnistamodOpt,
}
