//! ice-postproc - Post-processing rules for hourly cost and usage data
//!
//! Rules derive new tag groups from expressions over aggregated operands
//! (fixed rules) or redistribute existing tag groups in place using an
//! allocation report (variable rules).
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │ PostProcessor │────▶│     Rule     │────▶│ FixedRule-       │──┐
//! │ (rule order,  │     │  (compiled   │     │ Processor        │  │
//! │  window)      │     │   queries)   │     │ (expressions)    │  │
//! └───────────────┘     └──────────────┘     └──────────────────┘  │
//!                              │                                   ▼
//!                              │             ┌──────────────────┐ ┌──────────────────┐
//!                              └────────────▶│ VariableRule-    │▶│ CostAndUsageData │
//!                                            │ Processor        │ │ (tagged stores)  │
//!                                            │ (rayon, hourly)  │ └──────────────────┘
//!                                            └──────────────────┘
//!                                                   ▲
//!                               ┌──────────────────┐│┌──────────────────┐
//!                               │ AllocationReport ├┘│ KubernetesReport │
//!                               │ (csv / csv.gz)   │◀┤ (cluster usage)  │
//!                               └──────────────────┘ └──────────────────┘
//! ```

pub mod aggregation;
pub mod allocation_report;
pub mod cache;
pub mod cluster_name;
pub mod cluster_report;
pub mod config;
pub mod error;
pub mod expression;
pub mod fixed;
pub mod post_processor;
pub mod processor;
pub mod query;
pub mod report_writer;
pub mod rule;
pub mod stats;
pub mod variable;

// Re-exports for convenience
pub use aggregation::{Aggregation, AggregationTagGroup};
pub use allocation_report::{AllocationKey, AllocationReport, AllocationValue};
pub use cache::{CacheStats, OperandCache};
pub use cluster_name::ClusterNameBuilder;
pub use cluster_report::{KubernetesColumn, KubernetesReport};
pub use config::{
    AllocationConfig, KubernetesConfig, QueryConfig, ResultConfig, RuleConfig, TagGroupConfig,
    TagGroupFilterConfig,
};
pub use error::{PostProcError, Result};
pub use fixed::FixedRuleProcessor;
pub use post_processor::{PostProcessor, PostProcessorOptions};
pub use processor::{run_query, MetadataServices, QueryResult, RuleProcessor};
pub use query::Query;
pub use report_writer::{ReportAggregation, ReportWriter};
pub use rule::{ResultSpec, Rule, RuleKind};
pub use stats::{PostProcessorStats, RuleType};
pub use variable::{PreparedReport, VariableRuleProcessor};
