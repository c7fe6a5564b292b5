use genecache_core::config::hours;
use genecache_core::session::EvictionReport;
use genecache_core::SessionId;

use super::{load_config, open_cache, print_json};
use crate::cli::args::{EvictArgs, GlobalArgs};
use crate::exit_codes::{PARTIAL, SUCCESS};

pub async fn run(global: &GlobalArgs, args: EvictArgs) -> anyhow::Result<i32> {
    let config = load_config(global)?;
    let expiration = match args.expiration_hours {
        Some(h) => hours(h),
        None => config.expiration(),
    };
    let cache = open_cache(global, config)?;
    let sessions = cache.sessions();

    let reports: Vec<EvictionReport> = if let Some(id) = args.id {
        vec![sessions.evict_session(SessionId(id)).await?]
    } else if args.older {
        sessions.evict_older_than(expiration).await?
    } else {
        // --current; keep_cache turns this into a no-op
        sessions.clear_current().await?.into_iter().collect()
    };

    if global.json {
        print_json(&reports)?;
    } else if reports.is_empty() {
        println!("nothing to evict");
    } else {
        for r in &reports {
            println!(
                "session {} ({}): removed {}, failed {}",
                r.session_id,
                r.session_id.label(),
                r.removed,
                r.failures.len()
            );
            for (key, err) in &r.failures {
                println!("  {key}: {err}");
            }
        }
    }
    Ok(exit_code(&reports))
}

fn exit_code(reports: &[EvictionReport]) -> i32 {
    if reports.iter().all(EvictionReport::is_clean) {
        SUCCESS
    } else {
        PARTIAL
    }
}
