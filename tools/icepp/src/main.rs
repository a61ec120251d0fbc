//! icepp - cost and usage post-processing runner
//!
//! Loads a month of hourly cost and usage data from CSV, applies a rule file
//! and writes the processed data set.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::*;
use config::IceppConfig;
use ice_common::{init_logging, LogFormat};
use ice_postproc::ReportAggregation;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "icepp")]
#[command(about = "Post-process hourly cost and usage data with rule files")]
#[command(long_about = "Post-process hourly cost and usage data with rule files

Commands:
  run                 Apply a rule file to a data set and write the result
  validate            Compile every rule and report configuration errors
  allocation-report   Build a rule's allocation report for a month

Examples:
  icepp run --data data.csv --rules rules.yaml --month 2019-11 --out out.csv
  icepp validate --rules rules.yaml --tags Cluster,Environment
  icepp allocation-report --data data.csv --rules rules.yaml --rule k8s --month 2019-11 --out k8s.csv.gz")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (YAML, TOML or JSON)
    #[arg(short = 'c', long = "config", global = true, env = "ICEPP_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format: compact, pretty or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a rule file to a data set
    Run {
        /// Data set CSV
        #[arg(short, long)]
        data: PathBuf,

        /// Rule file (YAML or JSON)
        #[arg(short, long)]
        rules: PathBuf,

        /// Month to process, yyyy-MM
        #[arg(short, long)]
        month: Option<String>,

        /// Directory holding allocation and Kubernetes reports
        #[arg(long)]
        reports: Option<PathBuf>,

        /// Output file, gzipped when it ends in .gz
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Output time resolution: hourly, daily or monthly
        #[arg(short, long, default_value = "hourly")]
        aggregate: ReportAggregation,

        /// Allocation worker threads, 0 runs on the main thread
        #[arg(short, long)]
        threads: Option<usize>,
    },

    /// Compile every rule and report configuration errors
    Validate {
        /// Rule file (YAML or JSON)
        #[arg(short, long)]
        rules: PathBuf,

        /// User tag keys, comma separated (default: userTagKeys setting)
        #[arg(long, value_delimiter = ',')]
        tags: Option<Vec<String>>,
    },

    /// Build a rule's allocation report and write it
    AllocationReport {
        /// Data set CSV
        #[arg(short, long)]
        data: PathBuf,

        /// Rule file (YAML or JSON)
        #[arg(short, long)]
        rules: PathBuf,

        /// Name of the allocation rule
        #[arg(long)]
        rule: String,

        /// Month to process, yyyy-MM
        #[arg(short, long)]
        month: Option<String>,

        /// Directory holding the source reports
        #[arg(long)]
        reports: Option<PathBuf>,

        /// Output file, gzipped when it ends in .csv.gz
        #[arg(short, long)]
        out: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.no_color {
        colored::control::set_override(false);
    }
    match execute(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        },
    }
}

fn execute(cli: Cli) -> Result<ExitCode> {
    let mut config = IceppConfig::load(cli.config.as_deref())?;
    if cli.verbose {
        config.log.level = "debug".to_string();
    }
    if let Some(format) = cli.log_format {
        config.log.format = format;
    }
    if cli.no_color {
        config.log.ansi = false;
    }
    // Keep the guard alive so file logs are flushed on exit
    let _guard = init_logging(&config.log)?;

    match cli.command {
        Commands::Run {
            data,
            rules,
            month,
            reports,
            out,
            aggregate,
            threads,
        } => {
            apply_overrides(&mut config, month, reports);
            if let Some(threads) = threads {
                config.threads = threads;
            }
            let outcome = commands::run(&config, &data, &rules, out.as_deref(), aggregate)?;
            if cli.json {
                println!("{}", output::stats_json(&outcome.stats, outcome.cache)?);
            } else {
                output::print_stats(&outcome.stats, outcome.cache);
                if let Some(path) = &outcome.output {
                    println!("{} {}", "Output:".bright_cyan(), path.display());
                }
            }
            let failed = outcome.stats.iter().any(output::is_error);
            Ok(if failed { ExitCode::from(2) } else { ExitCode::SUCCESS })
        },
        Commands::Validate { rules, tags } => {
            let keys = tags.unwrap_or_else(|| config.user_tag_keys.clone());
            let results = commands::validate(&rules, &keys)?;
            let invalid = results.iter().filter(|(_, e)| e.is_some()).count();
            if cli.json {
                let value: Vec<serde_json::Value> = results
                    .iter()
                    .map(|(name, error)| serde_json::json!({ "rule": name, "error": error }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                for (name, error) in &results {
                    match error {
                        None => println!("  {} {}", "✓".green(), name),
                        Some(e) => println!("  {} {}: {}", "✗".red(), name.bold(), e),
                    }
                }
                println!();
                println!(
                    "{} {} rules, {} invalid",
                    "Validated".bright_cyan(),
                    results.len(),
                    invalid
                );
            }
            Ok(if invalid > 0 { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        },
        Commands::AllocationReport {
            data,
            rules,
            rule,
            month,
            reports,
            out,
        } => {
            apply_overrides(&mut config, month, reports);
            let notes = commands::allocation_report(&config, &data, &rules, &rule, &out)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "rule": rule, "notes": notes }))?);
            } else {
                println!("{} {}", "Wrote allocation report for".bright_cyan(), rule.bright_yellow());
                for note in notes {
                    println!("  {} {}", "!".yellow(), note);
                }
            }
            Ok(ExitCode::SUCCESS)
        },
    }
}

fn apply_overrides(config: &mut IceppConfig, month: Option<String>, reports: Option<PathBuf>) {
    if month.is_some() {
        config.month = month;
    }
    if let Some(reports) = reports {
        config.report_dir = reports;
    }
}
