//! Terminal output of rule statistics

use anyhow::Result;
use colored::*;
use ice_postproc::{CacheStats, PostProcessorStats};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunSummary<'a> {
    stats: &'a [PostProcessorStats],
    cache: CacheStats,
}

/// Stats as pretty JSON
pub fn stats_json(stats: &[PostProcessorStats], cache: CacheStats) -> Result<String> {
    Ok(serde_json::to_string_pretty(&RunSummary { stats, cache })?)
}

/// Entry for a rule that failed or was rejected
pub fn is_error(stats: &PostProcessorStats) -> bool {
    stats.info.starts_with("Error") || stats.info.contains("unsupported")
}

/// Plain table rows, one per stats entry
pub fn stats_rows(stats: &[PostProcessorStats]) -> Vec<[String; 6]> {
    stats
        .iter()
        .map(|s| {
            [
                s.rule_name.clone(),
                s.rule_type.to_string(),
                if s.non_resource { "non-resource" } else { "resource" }.to_string(),
                s.in_count.to_string(),
                s.out_count.to_string(),
                s.info.clone(),
            ]
        })
        .collect()
}

pub fn print_stats(stats: &[PostProcessorStats], cache: CacheStats) {
    const HEADER: [&str; 6] = ["Rule", "Type", "Data", "In", "Out", "Info"];
    let rows = stats_rows(stats);
    let mut widths: Vec<usize> = HEADER.iter().map(|h| h.len()).collect();
    for row in &rows {
        // Info is the last column and is never padded
        for (i, cell) in row.iter().enumerate().take(5) {
            widths[i] = widths[i].max(cell.len());
        }
    }

    println!();
    let header: Vec<String> = HEADER
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:<w$}", h, w = widths[i]))
        .collect();
    println!("{}", header.join("  ").bold());
    for (row, entry) in rows.iter().zip(stats) {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, c)| if i < 5 { format!("{:<w$}", c, w = widths[i]) } else { c.clone() })
            .collect();
        let line = cells.join("  ");
        if is_error(entry) {
            println!("{}", line.red());
        } else {
            println!("{}", line);
        }
    }

    let failed = stats.iter().filter(|s| is_error(s)).count();
    println!();
    if failed == 0 {
        println!("{} {} entries", "✓".green(), stats.len());
    } else {
        println!("{} {} of {} entries failed", "✗".red(), failed, stats.len());
    }
    println!(
        "{} {} hits, {} misses",
        "Operand cache:".bright_cyan(),
        cache.hits,
        cache.misses
    );
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use ice_postproc::RuleType;

    fn stats() -> Vec<PostProcessorStats> {
        vec![
            PostProcessorStats::new("surcharge", RuleType::Fixed, true, 2, 1, "elapsed 3ms"),
            PostProcessorStats::failed("broken", RuleType::Variable, "Error: Configuration error: bad"),
        ]
    }

    #[test]
    fn test_rows() {
        let rows = stats_rows(&stats());
        assert_eq!(rows[0][0], "surcharge");
        assert_eq!(rows[0][2], "non-resource");
        assert_eq!(rows[1][1], "Variable");
        assert!(is_error(&stats()[1]));
        assert!(!is_error(&stats()[0]));
    }

    #[test]
    fn test_json() {
        let json = stats_json(&stats(), CacheStats { hits: 3, misses: 1 }).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["stats"][0]["ruleName"], "surcharge");
        assert_eq!(value["stats"][0]["nonResource"], true);
        assert_eq!(value["stats"][1]["ruleType"], "Variable");
        assert_eq!(value["cache"]["hits"], 3);
    }
}
