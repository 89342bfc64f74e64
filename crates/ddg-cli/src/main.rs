use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use ddg_pipeline::{
    parse_id_filter, run_batch, run_merge, BatchOptions, DegreeReport, DegreeStatus,
    PipelineConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ddg-cli")]
#[command(about = "Generate bilingual degree descriptions and merge them into the catalog")]
struct Cli {
    /// Debug-level logging unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct Paths {
    /// Degree catalog (defaults to DEGREES_JSON).
    #[arg(long)]
    degrees_json: Option<PathBuf>,

    /// Directory holding per-degree units (defaults to OUTPUT_DIR).
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search, describe and translate each selected degree.
    Generate {
        /// List the degrees that would be processed; no network calls, no writes.
        #[arg(long)]
        dry_run: bool,

        /// Comma-separated degree ids to process.
        #[arg(long)]
        ids: Option<String>,

        /// Leave degrees that already have a unit alone.
        #[arg(long)]
        skip_existing: bool,

        #[command(flatten)]
        paths: Paths,
    },
    /// Write a copy of the catalog with generated descriptions folded in.
    Merge {
        #[command(flatten)]
        paths: Paths,

        /// Destination (defaults to `<catalog>.merged.json` beside the catalog).
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Per-degree outcome: progress on `out`, problems on `err`.
fn write_degree_line(report: &DegreeReport, out: &mut impl Write, err: &mut impl Write) -> io::Result<()> {
    let id = &report.id;
    match &report.status {
        DegreeStatus::SkippedExisting => writeln!(out, "Skip (exists): {id}"),
        DegreeStatus::Planned { name_it } => writeln!(out, "Would process: {id} ({name_it})"),
        DegreeStatus::Generated { path, .. } => writeln!(out, "Saved: {path}"),
        DegreeStatus::Failed { .. } => writeln!(err, "Failed: {id}"),
        DegreeStatus::InvalidId => writeln!(err, "Skipped (invalid id): {id:?}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Generate {
            dry_run,
            ids,
            skip_existing,
            paths,
        } => {
            let config = config.with_paths(paths.degrees_json, paths.output_dir);
            let options = BatchOptions {
                dry_run,
                ids: ids.as_deref().and_then(parse_id_filter),
                skip_existing,
            };
            let summary = run_batch(&config, &options).await?;
            let (mut out, mut err) = (io::stdout().lock(), io::stderr().lock());
            for report in &summary.degrees {
                write_degree_line(report, &mut out, &mut err)?;
            }
            writeln!(out, "Done: {}/{} degree(s)", summary.completed(), summary.selected)?;
        }
        Commands::Merge { paths, out } => {
            let config = config.with_paths(paths.degrees_json, paths.output_dir);
            let summary = run_merge(&config, out).await?;
            println!(
                "Wrote {} (updated {} degree(s)).",
                summary.destination.display(),
                summary.updated
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_flags_parse() {
        let cli = Cli::try_parse_from([
            "ddg-cli",
            "generate",
            "--dry-run",
            "--ids",
            "fisica,design",
            "--output-dir",
            "units",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Generate {
                dry_run,
                ids,
                skip_existing,
                paths,
            } => {
                assert!(dry_run);
                assert!(!skip_existing);
                assert_eq!(ids.as_deref(), Some("fisica,design"));
                assert_eq!(paths.output_dir, Some(PathBuf::from("units")));
                assert_eq!(paths.degrees_json, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn merge_accepts_destination() {
        let cli = Cli::try_parse_from(["ddg-cli", "merge", "--out", "merged.json"]).unwrap();
        match cli.command {
            Commands::Merge { out, .. } => assert_eq!(out, Some(PathBuf::from("merged.json"))),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn degree_lines_split_progress_and_failures() {
        let reports = [
            DegreeReport {
                id: "fisica".into(),
                status: DegreeStatus::SkippedExisting,
            },
            DegreeReport {
                id: "design".into(),
                status: DegreeStatus::Generated {
                    path: "output/design.json".into(),
                    english_fallback: false,
                },
            },
            DegreeReport {
                id: "lettere".into(),
                status: DegreeStatus::Failed {
                    reason: "http status 500".into(),
                },
            },
        ];
        let (mut out, mut err) = (Vec::new(), Vec::new());
        for report in &reports {
            write_degree_line(report, &mut out, &mut err).unwrap();
        }
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Skip (exists): fisica\nSaved: output/design.json\n"
        );
        assert_eq!(String::from_utf8(err).unwrap(), "Failed: lettere\n");
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["ddg-cli"]).is_err());
    }
}
