use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pdc_core::{GeoLevel, Statistic, Table, Value};
use pdc_geo::{JoinKind, RawGeoKey};
use pdc_pipeline::{write_query_outputs, Pipeline, PipelineConfig, QuerySpec};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "pdc")]
#[command(about = "Public data connectors: cached fetch, geographic roll-up and merge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load sources into the cache (all enabled sources when none are named).
    Fetch {
        sources: Vec<String>,
        /// Bypass the freshness check and re-fetch.
        #[arg(long)]
        refresh: bool,
    },
    /// Bring sources to one level and join them on the geographic key.
    Query {
        #[arg(long = "source", required = true)]
        sources: Vec<String>,
        #[arg(long, value_parser = parse_level)]
        level: GeoLevel,
        #[arg(long, default_value = "weighted_mean", value_parser = parse_statistic)]
        statistic: Statistic,
        #[arg(long, default_value = "inner", value_parser = parse_join)]
        join: JoinKind,
        #[arg(long)]
        refresh: bool,
        /// Write parquet, report and manifest under this directory instead of
        /// printing the table.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the canonical identifier for a raw key.
    Normalize {
        key: String,
        #[arg(long, value_parser = parse_level)]
        level: Option<GeoLevel>,
        /// Treat `key` as a county name within this state.
        #[arg(long)]
        state: Option<String>,
    },
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Debug, Subcommand)]
enum CacheCommands {
    Status,
    /// Delete entries older than their recorded TTL.
    Purge,
    /// Re-hash cached payloads and report any that no longer match.
    Verify,
}

fn parse_level(raw: &str) -> Result<GeoLevel, String> {
    raw.parse::<GeoLevel>().map_err(|e| e.to_string())
}

fn parse_statistic(raw: &str) -> Result<Statistic, String> {
    raw.parse()
}

fn parse_join(raw: &str) -> Result<JoinKind, String> {
    raw.parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pdc_pipeline=info".parse()?)
                .add_directive("pdc_storage=info".parse()?)
                .add_directive("pdc_geo=warn".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    let pipeline = Pipeline::from_config(config).await?;

    match cli.command {
        Commands::Fetch { sources, refresh } => {
            let sources = if sources.is_empty() {
                pipeline
                    .registry()
                    .enabled()
                    .map(|c| c.source_id.clone())
                    .collect()
            } else {
                sources
            };
            for source_id in sources {
                let dataset = pipeline.load_dataset(&source_id, refresh).await?;
                println!(
                    "{}\t{}\t{} records\t{:?}\t{}",
                    dataset.source_id,
                    dataset.level,
                    dataset.records.len(),
                    dataset.cache_status,
                    dataset.cache_entry.payload_location.display()
                );
            }
        }
        Commands::Query {
            sources,
            level,
            statistic,
            join,
            refresh,
            out,
        } => {
            let spec = QuerySpec {
                sources,
                level,
                statistic,
                join,
                force_refresh: refresh,
            };
            let outcome = pipeline.query(&spec).await?;
            for source in &outcome.report.sources {
                if source.served_stale {
                    eprintln!(
                        "warning: {} served from stale cache fetched at {}",
                        source.source_id, source.fetched_at
                    );
                }
                if !source.unmapped_units.is_empty() {
                    eprintln!(
                        "warning: {} had {} units without a crosswalk entry",
                        source.source_id,
                        source.unmapped_units.len()
                    );
                }
            }
            match out {
                Some(dir) => {
                    let summary = write_query_outputs(&dir, &outcome)?;
                    info!(run_id = %outcome.report.run_id, "query exported");
                    println!(
                        "query complete: run_id={} rows={} low_reliability={} dir={}",
                        outcome.report.run_id,
                        outcome.report.rows,
                        outcome.report.low_reliability_rows(),
                        summary.dir.display()
                    );
                }
                None => print_table(&outcome.table),
            }
        }
        Commands::Normalize { key, level, state } => {
            let raw = match state {
                Some(state) => RawGeoKey::CountyName { county: key, state },
                None if key.chars().any(|c| c.is_ascii_alphabetic())
                    && !key.trim().eq_ignore_ascii_case("us") =>
                {
                    RawGeoKey::StateName(key)
                }
                None => RawGeoKey::Code(key),
            };
            let id = pipeline.normalizer().normalize(&raw, level)?;
            println!("{}\t{}", id, id.level());
        }
        Commands::Cache { command } => match command {
            CacheCommands::Status => {
                for status in pipeline.cache_status().await? {
                    println!(
                        "{}\t{}\t{} bytes\tfetched {}\t{}",
                        if status.stale { "stale" } else { "fresh" },
                        status.entry.source_key,
                        status.entry.byte_size,
                        status.entry.fetched_at,
                        status.entry.payload_location.display()
                    );
                }
            }
            CacheCommands::Purge => {
                let removed = pipeline.purge_stale().await?;
                println!("purged {removed} stale entries");
            }
            CacheCommands::Verify => {
                let checks = pipeline.verify_cache().await?;
                for check in &checks {
                    println!(
                        "{}\t{}\t{}",
                        if check.intact { "ok" } else { "corrupt" },
                        check.entry.source_key,
                        check.entry.content_hash
                    );
                }
                if checks.iter().any(|c| !c.intact) {
                    anyhow::bail!("cache verification failed");
                }
            }
        },
    }

    Ok(())
}

fn print_table(table: &Table) {
    println!("{}", table.column_names().join("\t"));
    for row in table.rows() {
        let cells = row
            .values()
            .iter()
            .map(|v| match v {
                Value::Text(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Flag(b) => b.to_string(),
                Value::Missing => String::new(),
            })
            .collect::<Vec<_>>();
        println!("{}", cells.join("\t"));
    }
}
