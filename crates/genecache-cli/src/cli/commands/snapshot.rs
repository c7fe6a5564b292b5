use std::fs;
use std::io::Write;

use anyhow::Context;
use genecache_core::{ExportOptions, ImportOptions, KeyForm, SnapshotEntry};

use super::{load_config, open_cache, print_json};
use crate::cli::args::{ExportArgs, GlobalArgs, ImportArgs};
use crate::exit_codes::SUCCESS;

pub async fn export(global: &GlobalArgs, args: ExportArgs) -> anyhow::Result<i32> {
    let cache = open_cache(global, load_config(global)?)?;
    let options = ExportOptions {
        skip_kinds: args.skip_kinds,
        only_kinds: args.only_kinds,
        unit_name: args.gene,
        key_form: if args.portable {
            KeyForm::Portable
        } else {
            KeyForm::Full
        },
        decompress: args.decompress,
    };
    let bundle = cache.export(&options).await?;
    let text = serde_json::to_string_pretty(&bundle).context("failed to serialize bundle")?;

    match args.out {
        Some(path) => {
            let mut file = fs::File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            file.write_all(text.as_bytes())?;
            tracing::info!(entries = bundle.len(), path = %path.display(), "bundle written");
        }
        None => println!("{text}"),
    }
    Ok(SUCCESS)
}

pub async fn import(global: &GlobalArgs, args: ImportArgs) -> anyhow::Result<i32> {
    let text = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let bundle: Vec<SnapshotEntry> = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a bundle", args.input.display()))?;

    let cache = open_cache(global, load_config(global)?)?;
    let options = ImportOptions {
        skip_kinds: args.skip_kinds,
    };
    // ImportFailed propagates and maps to the partial exit code
    let report = cache
        .import(bundle, !args.uncompressed, &options, None)
        .await?;

    if global.json {
        print_json(&report)?;
    } else {
        println!(
            "session {}: cleared {}, written {}, skipped {}",
            report.session_id, report.cleared, report.written, report.skipped
        );
    }
    Ok(SUCCESS)
}
