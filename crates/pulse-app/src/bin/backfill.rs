//! `pulse-backfill` - replay agent transcripts into the activity store.
//!
//! Exits non-zero when a post failed; the next run resumes from the
//! persisted offsets.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use pulse_app::cli::BackfillArgs;
use pulse_app::logging;
use pulse_backfill::scanner::parse_since;
use pulse_backfill::{ScanOptions, Scanner};
use pulse_core::config::PulseConfig;
use pulse_sink::HttpSink;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = BackfillArgs::parse();
    let mut config = PulseConfig::load_or_default(&args.resolve_config_path());
    args.apply(&mut config);

    logging::init(&config.general.log_level, args.cron);

    let mut options = ScanOptions::from_config(&config.backfill);
    options.since = args.since.as_deref().map(parse_since).transpose()?;
    options.dry_run = args.dry_run;

    let sink = Arc::new(HttpSink::from_config(&config.sink));
    tracing::info!(
        sink = %sink.url(),
        roots = ?options.roots,
        state_file = %options.state_file.display(),
        "Backfill configured"
    );

    let scanner = Scanner::new(options, sink.clone(), sink);
    let report = scanner.run().await?;

    if !args.cron || report.did_work() {
        println!("{}", report.summary());
    }

    if report.post_errors > 0 {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
