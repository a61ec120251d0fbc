//! Rule orchestration for one processing period

use crate::cache::CacheStats;
use crate::config::RuleConfig;
use crate::error::{PostProcError, Result};
use crate::fixed::FixedRuleProcessor;
use crate::processor::{MetadataServices, RuleProcessor};
use crate::rule::Rule;
use crate::stats::{PostProcessorStats, RuleType};
use crate::variable::VariableRuleProcessor;
use chrono::{DateTime, Utc};
use ice_model::time::month_label;
use ice_model::CostAndUsageData;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{error, info};

/// Post-processor settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PostProcessorOptions {
    /// Allocation worker threads, 0 runs allocations on the caller's thread
    pub num_threads: usize,
    /// Directory holding allocation and Kubernetes reports
    pub report_dir: PathBuf,
    /// Directory receiving archived generated allocation reports
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<PathBuf>,
}

/// Applies a list of rules, in order, to a data set
pub struct PostProcessor {
    options: PostProcessorOptions,
    pool: Option<ThreadPool>,
    cache_stats: CacheStats,
}

impl PostProcessor {
    pub fn new(options: PostProcessorOptions) -> Result<Self> {
        let pool = if options.num_threads > 0 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(options.num_threads)
                .thread_name(|i| format!("icepp-alloc-{}", i))
                .build()
                .map_err(|e| PostProcError::config(format!("Unable to start allocation workers: {}", e)))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self {
            options,
            pool,
            cache_stats: CacheStats::default(),
        })
    }

    /// Operand cache counters summed over every processed rule
    pub fn cache_stats(&self) -> CacheStats {
        self.cache_stats
    }

    /// Apply every rule active in `period`
    ///
    /// A failing rule is logged and recorded in its stats entry; the
    /// remaining rules still run and see the writes of the ones before them.
    /// A failing rule is not rolled back. Outputs it wrote before the failure
    /// stay in `data`; see [`FixedRuleProcessor`](crate::FixedRuleProcessor)
    /// for which outputs those are.
    pub fn process(
        &mut self,
        period: &DateTime<Utc>,
        rule_configs: &[RuleConfig],
        data: &mut CostAndUsageData,
        services: &MetadataServices,
    ) -> Vec<PostProcessorStats> {
        info!(
            "Post-process {} rules for {}",
            rule_configs.len(),
            month_label(period)
        );
        let mut stats = Vec::new();
        for config in rule_configs {
            let rule_type = if config.allocation.is_some() {
                RuleType::Variable
            } else {
                RuleType::Fixed
            };
            match self.process_rule(period, config, data, services) {
                Ok(rule_stats) => stats.extend(rule_stats),
                Err(e) => {
                    error!(
                        "Error post-processing cost and usage data for rule {}: {}",
                        config.name, e
                    );
                    stats.push(PostProcessorStats::failed(
                        config.name.clone(),
                        rule_type,
                        format!("Error: {}", e),
                    ));
                },
            }
        }
        stats
    }

    fn process_rule(
        &mut self,
        period: &DateTime<Utc>,
        config: &RuleConfig,
        data: &mut CostAndUsageData,
        services: &MetadataServices,
    ) -> Result<Vec<PostProcessorStats>> {
        info!("-------- Process rule: \"{}\" --------", config.name);
        if !config.is_active(period)? {
            info!(
                "Post-process rule {} is not active for this month, start={}, end={}",
                config.name, config.start, config.end
            );
            return Ok(Vec::new());
        }

        let rule = Rule::new(config.clone(), data.user_tag_keys())?;

        if rule.allocation().is_some() {
            if rule.in_query().has_aggregation() {
                let msg = format!(
                    "In-place allocation with aggregation is currently unsupported, in: {}",
                    rule.in_query()
                );
                error!("{}", msg);
                return Ok(vec![PostProcessorStats::failed(
                    rule.name(),
                    RuleType::Variable,
                    msg,
                )]);
            }
            let mut processor = VariableRuleProcessor::new(&rule, services, &self.options.report_dir);
            if let Some(pool) = &self.pool {
                processor = processor.with_pool(pool);
            }
            if let Some(dir) = &self.options.archive_dir {
                processor = processor.with_archive_dir(dir);
            }
            processor.process(data)
        } else {
            let mut processor = FixedRuleProcessor::new(&rule, services);
            let result = processor.process(data);
            self.cache_stats += processor.cache_stats();
            result
        }
    }
}
