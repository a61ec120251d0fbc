//! Subcommand implementations

use crate::config::IceppConfig;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use ice_model::CostAndUsageData;
use ice_postproc::{
    CacheStats, MetadataServices, PostProcessor, PostProcessorOptions, PostProcessorStats,
    ReportAggregation, ReportWriter, Rule, RuleConfig, VariableRuleProcessor,
};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Result of `icepp run`
pub struct RunOutcome {
    pub stats: Vec<PostProcessorStats>,
    pub cache: CacheStats,
    pub output: Option<PathBuf>,
}

pub fn load_data(path: &Path, period: DateTime<Utc>, config: &IceppConfig) -> Result<CostAndUsageData> {
    let file = File::open(path).with_context(|| format!("Unable to open data file {}", path.display()))?;
    let data = CostAndUsageData::load_csv(period, BufReader::new(file))
        .with_context(|| format!("Unable to load data file {}", path.display()))?;
    if !config.user_tag_keys.is_empty() && config.user_tag_keys != data.user_tag_keys() {
        bail!(
            "Data file user tags {:?} do not match the configured user tag keys {:?}",
            data.user_tag_keys(),
            config.user_tag_keys
        );
    }
    Ok(data)
}

pub fn load_rules(path: &Path) -> Result<Vec<RuleConfig>> {
    RuleConfig::load_file(path).with_context(|| format!("Unable to load rules from {}", path.display()))
}

fn options(config: &IceppConfig) -> PostProcessorOptions {
    PostProcessorOptions {
        num_threads: config.threads,
        report_dir: config.report_dir.clone(),
        archive_dir: config.archive_dir.clone(),
    }
}

/// Apply every rule to a data file and optionally write the result
pub fn run(
    config: &IceppConfig,
    data_path: &Path,
    rules_path: &Path,
    out: Option<&Path>,
    aggregation: ReportAggregation,
) -> Result<RunOutcome> {
    let period = config.period()?;
    let rules = load_rules(rules_path)?;
    let mut data = load_data(data_path, period, config)?;
    let services = MetadataServices::default();

    let mut processor = PostProcessor::new(options(config))?;
    let stats = processor.process(&period, &rules, &mut data, &services);

    let output = match out {
        Some(name) => {
            let path = config.output_path(name);
            ReportWriter::new(&services, aggregation)
                .write_file(&path, &data)
                .with_context(|| format!("Unable to write {}", path.display()))?;
            Some(path)
        },
        None => None,
    };

    Ok(RunOutcome {
        stats,
        cache: processor.cache_stats(),
        output,
    })
}

/// Compile every rule, returning each rule's name and configuration error
pub fn validate(rules_path: &Path, user_tag_keys: &[String]) -> Result<Vec<(String, Option<String>)>> {
    let rules = load_rules(rules_path)?;
    let mut results = Vec::with_capacity(rules.len());
    for config in rules {
        let name = config.name.clone();
        let error = match config.start_date().and_then(|_| config.end_date()) {
            Err(e) => Some(e.to_string()),
            Ok(_) => Rule::new(config, user_tag_keys).err().map(|e| e.to_string()),
        };
        if let Some(e) = &error {
            warn!("Rule {} is invalid: {}", name, e);
        }
        results.push((name, error));
    }
    Ok(results)
}

/// Build a rule's allocation report for the month and write it to `out`
///
/// Returns the notes gathered while generating the report.
pub fn allocation_report(
    config: &IceppConfig,
    data_path: &Path,
    rules_path: &Path,
    rule_name: &str,
    out: &Path,
) -> Result<Vec<String>> {
    let period = config.period()?;
    let rules = load_rules(rules_path)?;
    let rule_config = rules
        .into_iter()
        .find(|r| r.name == rule_name)
        .with_context(|| format!("No rule named {} in {}", rule_name, rules_path.display()))?;
    if rule_config.allocation.is_none() {
        bail!("Rule {} is not an allocation rule", rule_name);
    }

    let data = load_data(data_path, period, config)?;
    let rule = Rule::new(rule_config, data.user_tag_keys())?;
    let services = MetadataServices::default();
    let processor = VariableRuleProcessor::new(&rule, &services, &config.report_dir);
    let Some(prepared) = processor.allocation_report(&data)? else {
        bail!(
            "No source report for rule {} in {}",
            rule_name,
            config.report_dir.display()
        );
    };

    let path = config.output_path(out);
    let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if let Some(name) = file_name.strip_suffix(".csv.gz") {
        let dir = path.parent().unwrap_or(Path::new("."));
        prepared.report.archive_report(dir, name)?;
    } else {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path).with_context(|| format!("Unable to create {}", path.display()))?;
        prepared.report.write_csv(file)?;
    }
    info!("Wrote allocation report for rule {} to {}", rule_name, path.display());
    Ok(prepared.notes)
}
