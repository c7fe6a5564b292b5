use genecache_core::{SizeReport, SessionId};

use super::{load_config, open_cache, print_json};
use crate::cli::args::{GlobalArgs, SessionsArgs};
use crate::exit_codes::SUCCESS;

pub async fn run(global: &GlobalArgs, args: SessionsArgs) -> anyhow::Result<i32> {
    let mut config = load_config(global)?;
    if let Some(hours) = args.expiration_hours {
        config.expiration_hours = hours;
    }
    let cache = open_cache(global, config)?;
    let report = cache.sessions().size_report_at(SessionId::now()).await?;

    if global.json {
        print_json(&report)?;
    } else {
        print!("{}", render(&report));
    }
    Ok(SUCCESS)
}

fn render(report: &SizeReport) -> String {
    let mut out = format!(
        "current  {:>10.2} MB  ({})\n",
        SizeReport::megabytes(report.current_bytes),
        report.current_session.label()
    );
    out.push_str(&format!(
        "recent   {:>10.2} MB  ({} sessions)\n",
        SizeReport::megabytes(report.recent_bytes),
        report.recent_sessions.len()
    ));
    for s in &report.recent_sessions {
        out.push_str(&format!("           {}  {}\n", s.session_id, s.label));
    }
    out.push_str(&format!(
        "old      {:>10.2} MB  ({} sessions)\n",
        SizeReport::megabytes(report.old_bytes),
        report.old_sessions.len()
    ));
    for s in &report.old_sessions {
        out.push_str(&format!("           {}  {}\n", s.session_id, s.label));
    }
    out.push_str(&format!(
        "total    {:>10.2} MB\n",
        SizeReport::megabytes(report.total_bytes())
    ));
    out
}
