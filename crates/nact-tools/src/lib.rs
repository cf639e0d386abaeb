//! Plomberie partagée des binaires `nactc` et `nactdc` : options communes,
//! initialisation du tracing, résolution du dialecte.

#![deny(missing_docs)]

use anyhow::{bail, Result};
use nact_core::{game, SysVer};

/// Version affichée par `-v`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Installe le souscripteur tracing des binaires. `verbose` remonte le
/// filtre par défaut à `info`.
pub fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}

/// Décode l'argument `-E{s|u}`.
pub fn parse_encoding(arg: &str) -> Result<bool> {
    match arg.chars().next() {
        Some('u' | 'U') => Ok(true),
        Some('s' | 'S') => Ok(false),
        _ => bail!("Unknown encoding {arg}"),
    }
}

/// Décode l'argument `-s <sys-ver>`.
pub fn parse_sys_ver(arg: &str) -> Result<SysVer> {
    match SysVer::from_opt(arg) {
        Some(ver) => Ok(ver),
        None => bail!("Unknown system version '{arg}'"),
    }
}

/// Décode l'argument `-G <game>`.
pub fn parse_game(arg: &str) -> Result<&'static game::GameInfo> {
    match game::by_name(arg) {
        Some(info) => Ok(info),
        None => bail!("Unknown game '{arg}'"),
    }
}
