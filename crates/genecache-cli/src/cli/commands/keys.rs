use genecache_core::CacheKey;

use super::{load_config, open_cache, print_json};
use crate::cli::args::{GlobalArgs, KeysArgs};
use crate::exit_codes::SUCCESS;

pub async fn run(global: &GlobalArgs, args: KeysArgs) -> anyhow::Result<i32> {
    let cache = open_cache(global, load_config(global)?)?;
    let mut keys = cache.storage().list_all_keys().await?;
    if !args.all {
        keys.retain(|k| CacheKey::decode(k).is_some());
    }
    keys.sort();

    if global.json {
        print_json(&keys)?;
    } else {
        for key in &keys {
            println!("{key}");
        }
    }
    Ok(SUCCESS)
}
