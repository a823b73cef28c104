use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dealwatch_sync::{run_scheduled, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dealwatch")]
#[command(about = "Scrape offer sources and write a deduplicated HTML digest")]
struct Cli {
    /// Comma separated source ids (default: every enabled source).
    #[arg(long, value_delimiter = ',')]
    sources: Vec<String>,

    /// Run daily at this 24h local time (HH:MM).
    #[arg(long, value_name = "HH:MM")]
    schedule: Option<String>,

    /// Single run (the default without --schedule); with --schedule, skip the run at startup.
    #[arg(long)]
    once: bool,

    /// Digest output path (overrides DEALWATCH_OUTPUT).
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Email the digest using the DEALWATCH_SMTP_* / DEALWATCH_MAIL_* settings.
    #[arg(long)]
    email: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dealwatch=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(output) = cli.output {
        config.output_path = output;
    }
    config.email |= cli.email;
    let pipeline = SyncPipeline::new(config)?;

    match cli.schedule {
        Some(at) => {
            info!(at, sources = ?cli.sources, "starting scheduler");
            run_scheduled(Arc::new(pipeline), cli.sources, &at, !cli.once).await?;
        }
        None => {
            let summary = pipeline.run_once(&cli.sources).await?;
            println!(
                "sync complete: run_id={} sources={} fresh={} unique={} clusters={} failed=[{}] output={} emailed={}",
                summary.run_id,
                summary.sources.len(),
                summary.fresh_offers,
                summary.unique_offers,
                summary.duplicate_clusters,
                summary.failed_sources.join(","),
                summary.output_path.display(),
                summary.emailed
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_are_comma_separated() {
        let cli = Cli::parse_from(["dealwatch", "--sources", "pepper,lzx"]);
        assert_eq!(cli.sources, vec!["pepper", "lzx"]);
        assert!(cli.schedule.is_none());
        assert!(!cli.once);
        assert!(!cli.email);
    }

    #[test]
    fn schedule_with_once_and_output() {
        let cli = Cli::parse_from([
            "dealwatch", "--schedule", "07:30", "--once", "--output", "out/d.html", "--email",
        ]);
        assert_eq!(cli.schedule.as_deref(), Some("07:30"));
        assert!(cli.once);
        assert_eq!(cli.output, Some(PathBuf::from("out/d.html")));
        assert!(cli.sources.is_empty());
        assert!(cli.email);
    }
}
