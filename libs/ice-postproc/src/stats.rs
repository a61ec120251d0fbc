//! Per-rule processing statistics

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Kind of rule a stats entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleType {
    /// Expression results
    Fixed,
    /// In-place allocation
    Variable,
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleType::Fixed => f.write_str("Fixed"),
            RuleType::Variable => f.write_str("Variable"),
        }
    }
}

/// Outcome of one processing pass of a rule
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostProcessorStats {
    pub rule_name: String,
    pub rule_type: RuleType,
    /// Pass over non-resource data
    pub non_resource: bool,
    /// Input aggregations
    pub in_count: usize,
    /// Output tag groups written
    pub out_count: usize,
    /// Elapsed time plus any skip, warning or error reason
    pub info: String,
}

impl PostProcessorStats {
    pub fn new(
        rule_name: impl Into<String>,
        rule_type: RuleType,
        non_resource: bool,
        in_count: usize,
        out_count: usize,
        info: impl Into<String>,
    ) -> Self {
        Self {
            rule_name: rule_name.into(),
            rule_type,
            non_resource,
            in_count,
            out_count,
            info: info.into(),
        }
    }

    /// Entry for a rule that failed or was skipped before doing any work
    pub fn failed(rule_name: impl Into<String>, rule_type: RuleType, info: impl Into<String>) -> Self {
        Self::new(rule_name, rule_type, false, 0, 0, info)
    }
}

impl fmt::Display for PostProcessorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}{}): in {}, out {}; {}",
            self.rule_name,
            self.rule_type,
            if self.non_resource { ", non-resource" } else { "" },
            self.in_count,
            self.out_count,
            self.info
        )
    }
}

/// `Elapsed time: 1.234s`
pub fn elapsed_info(elapsed: Duration) -> String {
    format!("Elapsed time: {:.3}s", elapsed.as_secs_f64())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_camel_case() {
        let stats = PostProcessorStats::new("amortize", RuleType::Fixed, true, 3, 2, "Elapsed time: 0.001s");
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["ruleName"], "amortize");
        assert_eq!(json["ruleType"], "Fixed");
        assert_eq!(json["nonResource"], true);
        assert_eq!(json["outCount"], 2);
    }

    #[test]
    fn test_elapsed_info() {
        assert_eq!(elapsed_info(Duration::from_millis(1500)), "Elapsed time: 1.500s");
    }
}
