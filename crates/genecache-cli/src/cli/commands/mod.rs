use super::args::*;

pub mod contents;
pub mod evict;
pub mod keys;
pub mod sessions;
pub mod snapshot;

use std::sync::Arc;

use anyhow::Context;
use genecache_core::{CacheConfig, CacheEvent, EventSink, GeneCache, SessionId, Severity};

use crate::exit_codes::SUCCESS;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let global = cli.global;
    match cli.cmd {
        Command::Sessions(args) => sessions::run(&global, args).await,
        Command::Evict(args) => evict::run(&global, args).await,
        Command::Contents(args) => contents::run(&global, args).await,
        Command::Keys(args) => keys::run(&global, args).await,
        Command::Export(args) => snapshot::export(&global, args).await,
        Command::Import(args) => snapshot::import(&global, args).await,
        Command::Version => {
            println!("genecache {}", env!("CARGO_PKG_VERSION"));
            Ok(SUCCESS)
        }
    }
}

/// Config from `--config` (with environment overrides) or from the environment alone.
pub(crate) fn load_config(global: &GlobalArgs) -> anyhow::Result<CacheConfig> {
    let config = match &global.config {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::from_env()?,
    };
    tracing::debug!(
        backend = ?config.effective_backend(),
        expiration_hours = config.expiration_hours,
        "config loaded"
    );
    Ok(config)
}

pub(crate) fn session_of(global: &GlobalArgs) -> SessionId {
    global.session.map(SessionId).unwrap_or_else(SessionId::now)
}

pub(crate) fn open_cache(global: &GlobalArgs, config: CacheConfig) -> anyhow::Result<GeneCache> {
    let session = session_of(global);
    let cache = GeneCache::open(config, session, log_sink())?;
    tracing::debug!(%session, backend = cache.storage().backend_name(), "cache opened");
    Ok(cache)
}

/// Alerts surface as log lines; the CLI has no other consumer for events.
fn log_sink() -> EventSink {
    Arc::new(|event: CacheEvent| {
        if let CacheEvent::AlertIssued(alert) = event {
            match alert.severity {
                Severity::Warning => tracing::warn!(unit = ?alert.unit_name, "{}", alert.message),
                Severity::Error => tracing::error!(unit = ?alert.unit_name, "{}", alert.message),
            }
        }
    })
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_session_wins() {
        let global = GlobalArgs {
            config: None,
            session: Some(42),
            json: false,
        };
        assert_eq!(session_of(&global), SessionId(42));
    }
}
