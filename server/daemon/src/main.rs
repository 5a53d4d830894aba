//! The tunnistamod binary: starts the identity provider, and carries the
//! administrative subcommands that act on the same database.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use url::Url;

use tunnistamod_core::config::ServerConfig;
use tunnistamod_core::{create_server_core, setup_idms};
use tunnistamod_lib::idm::apis::{Api, ApiScope};
use tunnistamod_lib::idm::clients::{Client, ClientOptions, ClientType};
use tunnistamod_lib::prelude::*;
use tunnistamod_lib::utils::generate_opaque_token;

include!("./opt.rs");

impl TunnistamodOpt {
    fn commonopt(&self) -> &CommonOpt {
        match self {
            TunnistamodOpt::Server(copt) | TunnistamodOpt::RotateKeys(copt) => copt,
            TunnistamodOpt::ImportKey(opt) => &opt.commonopts,
            TunnistamodOpt::CreateClient(opt) => &opt.commonopts,
            TunnistamodOpt::CreateApi(opt) => &opt.commonopts,
            TunnistamodOpt::CreateApiScope(opt) => &opt.commonopts,
            TunnistamodOpt::AddScopeClient(opt) => &opt.commonopts,
            TunnistamodOpt::RecoverClientSecret(opt) => &opt.commonopts,
        }
    }
}

async fn run_server(config: ServerConfig) -> Result<(), OperationError> {
    let mut handle = create_server_core(config).await?;
    if tokio::signal::ctrl_c().await.is_err() {
        error!("Unable to listen for shutdown signal");
    }
    info!("Signal received, shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn run_admin(config: ServerConfig, opt: TunnistamodOpt) -> Result<(), OperationError> {
    let (idms, _saml) = setup_idms(&config).await?;
    let ct = duration_from_epoch_now();

    match opt {
        TunnistamodOpt::Server(_) => Ok(()),
        TunnistamodOpt::RotateKeys(_) => {
            let outcome = idms.rotate_keys(ct).await?;
            match &outcome.generated {
                Some(kid) => println!("generated signing key {kid}"),
                None => println!("active signing key still within its age limit"),
            }
            for kid in &outcome.expired {
                println!("retired key {kid} (verification only)");
            }
            for kid in &outcome.purged {
                println!("purged key {kid}");
            }
            Ok(())
        }
        TunnistamodOpt::ImportKey(opt) => {
            let pem = std::fs::read_to_string(&opt.key_path).map_err(|err| {
                error!(?err, path = %opt.key_path.display(), "Unable to read key file");
                OperationError::InvalidRequestState
            })?;
            let kid = idms.import_signing_key(&pem, ct).await?;
            println!("imported key {kid}, it will be retired at the next rotation");
            Ok(())
        }
        TunnistamodOpt::CreateClient(opt) => {
            let client_type = match opt.client_type.as_str() {
                "public" => ClientType::Public,
                "confidential" => ClientType::Confidential,
                other => {
                    error!(client_type = %other, "client type must be public or confidential");
                    return Err(OperationError::InvalidRequestState);
                }
            };
            let client_secret = generate_opaque_token();
            let name = if opt.name.is_empty() {
                opt.client_id.clone()
            } else {
                opt.name
            };
            let client = Client {
                client_id: opt.client_id.clone(),
                client_secret: client_secret.clone(),
                client_type,
                name,
                response_types: opt.response_types.into_iter().collect(),
                redirect_uris: opt.redirect_uris,
                post_logout_redirect_uris: opt.post_logout_redirect_uris,
                scope_allowlist: None,
                require_consent: opt.require_consent,
                options: ClientOptions {
                    site_type: None,
                    login_methods: opt.login_methods,
                    include_ad_groups: false,
                },
            };
            idms.upsert_client(client).await?;
            println!("created client {}", opt.client_id);
            println!("client secret: {client_secret}");
            Ok(())
        }
        TunnistamodOpt::CreateApi(opt) => {
            let api = Api {
                domain: opt.domain,
                name: opt.name,
                required_scopes: opt.required_scopes,
                oidc_client_id: opt.oidc_client_id,
                backchannel_logout_url: opt.backchannel_logout_url,
            };
            let identifier = api.identifier();
            idms.upsert_api(api).await?;
            println!("created api {identifier}");
            Ok(())
        }
        TunnistamodOpt::CreateApiScope(opt) => {
            let api = idms
                .list_apis()
                .await?
                .into_iter()
                .find(|api| api.domain == opt.domain && api.name == opt.name)
                .ok_or(OperationError::NoMatchingEntries)?;
            let mut name_i18n = BTreeMap::new();
            if !opt.display_name.is_empty() {
                name_i18n.insert("en".to_string(), opt.display_name);
            }
            let scope = ApiScope::new(&api, opt.specifier.as_deref(), name_i18n, BTreeMap::new());
            let identifier = scope.identifier.clone();
            idms.upsert_api_scope(scope).await?;
            println!("created api scope {identifier}");
            Ok(())
        }
        TunnistamodOpt::AddScopeClient(opt) => {
            idms.allow_api_scope(&opt.scope_identifier, &opt.client_id)
                .await?;
            println!(
                "allowed client {} to request {}",
                opt.client_id, opt.scope_identifier
            );
            Ok(())
        }
        TunnistamodOpt::RecoverClientSecret(opt) => {
            let client = idms
                .client(&opt.client_id)
                .ok_or_else(|| OperationError::InvalidClientId(opt.client_id.clone()))?;
            let mut client = (*client).clone();
            client.client_secret = generate_opaque_token();
            let secret = client.client_secret.clone();
            idms.upsert_client(client).await?;
            println!("new secret for {}: {secret}", opt.client_id);
            Ok(())
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    let opt = TunnistamodParser::parse();

    let cfg_path = opt.commands.commonopt().config_path.clone();
    let config = match ServerConfig::new(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Unable to read configuration {}: {err}", cfg_path.display());
            return ExitCode::FAILURE;
        }
    };

    sketching::init(config.log_level.as_deref().unwrap_or("info"));

    let result = match opt.commands {
        TunnistamodOpt::Server(_) => run_server(config).await,
        admin => run_admin(config, admin).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(?err, "Operation failed");
            ExitCode::FAILURE
        }
    }
}
