//! The Tunnistamo server core. This wires the IDM library to the outside:
//! the axum HTTP layer, configuration loading, the scheduled maintenance
//! task and the lifecycle of the whole server process.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

#[macro_use]
extern crate sketching;

#[macro_use]
extern crate tracing;

pub mod config;
pub mod https;
mod interval;

use std::sync::Arc;

use tokio::sync::broadcast;

use tunnistamod_lib::be::Db;
use tunnistamod_lib::idm::server::IdmServer;
use tunnistamod_lib::idm::upstream::SamlProvider;
use tunnistamod_lib::prelude::*;

use crate::config::ServerConfig;
use crate::interval::IntervalActor;

#[derive(Clone, Debug)]
pub enum CoreAction {
    Shutdown,
}

pub struct CoreHandle {
    clean_shutdown: bool,
    tx: broadcast::Sender<CoreAction>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl CoreHandle {
    pub async fn shutdown(&mut self) {
        if self.tx.send(CoreAction::Shutdown).is_err() {
            eprintln!("No receivers acked shutdown request. Treating as unclean.");
            return;
        }

        while let Some(handle) = self.handles.pop() {
            if handle.await.is_err() {
                eprintln!("A task failed to join");
            }
        }

        self.clean_shutdown = true;
    }
}

impl Drop for CoreHandle {
    fn drop(&mut self) {
        if !self.clean_shutdown {
            eprintln!("server tasks were not shut down cleanly");
        }
    }
}

/// Open the database and assemble the IdmServer with its upstream
/// providers. The admin tools drive this without starting any listener.
pub async fn setup_idms(
    config: &ServerConfig,
) -> Result<(Arc<IdmServer>, Option<Arc<SamlProvider>>), OperationError> {
    let db = Db::new(&config.db_path)?;
    let (upstreams, saml) = config.build_upstreams()?;
    let idms = IdmServer::new(db, config.idm_config(), upstreams).await?;
    Ok((Arc::new(idms), saml))
}

pub async fn create_server_core(config: ServerConfig) -> Result<CoreHandle, OperationError> {
    let (idms, saml) = setup_idms(&config).await?;

    // Make sure a signing key exists before the first request needs one.
    let outcome = idms.rotate_keys(duration_from_epoch_now()).await?;
    if let Some(kid) = &outcome.generated {
        admin_info!(%kid, "Generated new signing key at startup");
    }

    for entry in &config.login_methods {
        idms.upsert_login_method(tunnistamod_lib::idm::clients::LoginMethod {
            provider_id: entry.provider_id.clone(),
            display: entry.display.clone(),
            order: entry.order,
            logo_url: entry.logo_url.clone(),
        })
        .await?;
    }

    let (broadcast_tx, _broadcast_rx) = broadcast::channel(4);

    let interval_handle = IntervalActor::start(idms.clone(), broadcast_tx.subscribe());

    let state = https::build_state(&config, idms, saml)?;
    let http_handle =
        https::create_https_server(&config.bindaddress, state, broadcast_tx.subscribe()).await?;

    info!("ready to rock! 🚀 ");

    Ok(CoreHandle {
        clean_shutdown: false,
        tx: broadcast_tx,
        handles: vec![interval_handle, http_handle],
    })
}
