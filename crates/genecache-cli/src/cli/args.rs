use clap::{Args, Parser, Subcommand};
use genecache_core::DataKind;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "genecache",
    version,
    about = "Inspect and maintain a genecache store: session sizes, eviction, contents, export and import"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// YAML config file (GENECACHE_* variables still override it)
    #[arg(long, global = true, env = "GENECACHE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Session to act on, in epoch milliseconds (default: a fresh session)
    #[arg(long, global = true, env = "GENECACHE_SESSION")]
    pub session: Option<i64>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Stored size per session class (current / recent / old)
    Sessions(SessionsArgs),
    /// Remove cached entries by session
    Evict(EvictArgs),
    /// Per-entry sizes, optionally filtered
    Contents(ContentsArgs),
    /// List cache keys
    Keys(KeysArgs),
    /// Write the session's entries as a JSON bundle
    Export(ExportArgs),
    /// Replace the session's entries with a JSON bundle
    Import(ImportArgs),
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct SessionsArgs {
    /// Age in hours at which a session counts as old (default from config)
    #[arg(long)]
    pub expiration_hours: Option<u64>,
}

#[derive(Args, Debug, Clone)]
#[command(group(clap::ArgGroup::new("target").required(true).args(["id", "older", "current"])))]
pub struct EvictArgs {
    /// Evict this session id
    #[arg(long)]
    pub id: Option<i64>,

    /// Evict every session older than the expiration
    #[arg(long)]
    pub older: bool,

    /// Evict the session given by --session (honours keep_cache)
    #[arg(long)]
    pub current: bool,

    /// Override the expiration used with --older
    #[arg(long)]
    pub expiration_hours: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ContentsArgs {
    #[arg(long)]
    pub relationship: Option<String>,

    #[arg(long)]
    pub gene: Option<String>,

    #[arg(long, value_parser = parse_kind)]
    pub kind: Option<DataKind>,

    /// Include every session, not just --session
    #[arg(long)]
    pub all_sessions: bool,
}

#[derive(Args, Debug, Clone)]
pub struct KeysArgs {
    /// Include keys that are not cache keys (flat store only)
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// Output file (default: stdout)
    #[arg(long, short)]
    pub out: Option<PathBuf>,

    #[arg(long = "skip-kind", value_parser = parse_kind)]
    pub skip_kinds: Vec<DataKind>,

    #[arg(long = "only-kind", value_parser = parse_kind)]
    pub only_kinds: Vec<DataKind>,

    #[arg(long)]
    pub gene: Option<String>,

    /// Write session-less keys
    #[arg(long)]
    pub portable: bool,

    /// Decode payloads instead of keeping stored text
    #[arg(long)]
    pub decompress: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    /// Bundle file
    pub input: PathBuf,

    /// String payloads are plain values, not stored text
    #[arg(long)]
    pub uncompressed: bool,

    #[arg(long = "skip-kind", value_parser = parse_kind)]
    pub skip_kinds: Vec<DataKind>,
}

fn parse_kind(s: &str) -> Result<DataKind, String> {
    s.parse::<DataKind>().map_err(|e| e.to_string())
}
