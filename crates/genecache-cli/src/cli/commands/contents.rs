use genecache_core::KeyFilter;

use super::{load_config, open_cache, print_json};
use crate::cli::args::{ContentsArgs, GlobalArgs};
use crate::exit_codes::SUCCESS;

pub async fn run(global: &GlobalArgs, args: ContentsArgs) -> anyhow::Result<i32> {
    let cache = open_cache(global, load_config(global)?)?;
    let filter = KeyFilter {
        relationship: args.relationship,
        unit_name: args.gene,
        data_kind: args.kind,
        all_sessions: args.all_sessions,
    };
    let report = cache.sessions().contents(&filter).await?;

    if global.json {
        print_json(&report)?;
        return Ok(SUCCESS);
    }
    for entry in &report.entries {
        println!("{:>10}  {}", entry.bytes, entry.key);
    }
    for (kind, bytes) in &report.by_kind {
        println!("{:<16} {bytes:>10}", kind.as_tag());
    }
    println!("{:<16} {:>10}", "total", report.total_bytes);
    Ok(SUCCESS)
}
