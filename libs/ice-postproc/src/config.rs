//! Rule configuration documents
//!
//! Rules are deserialized from YAML or JSON. Field names follow the camelCase
//! convention of the rule documents (`groupBy`, `groupByTags`, `tagMaps`, ...).
//!
//! ```yaml
//! - name: ComputedCost
//!   start: 2019-11
//!   end: 2022-11
//!   operands:
//!     data:
//!       filter:
//!         product: [AWSDataTransfer]
//!       groupBy: []
//!       monthly: true
//!   in:
//!     filter:
//!       product: [EC2Instance]
//!     groupBy: [account, region]
//!   results:
//!     - out:
//!         product: ComputedCost
//!         usageType: "${group}-requests"
//!       cost: "${in} * ${data} / 1000"
//! ```

use crate::error::{PostProcError, Result};
use chrono::{DateTime, Utc};
use ice_model::time::parse_date;
use ice_model::TagKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Per-dimension filter of a query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagGroupFilterConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_type: Option<Vec<String>>,
    /// User tag key to value patterns
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub user_tags: BTreeMap<String, Vec<String>>,
    /// Dimensions whose filters exclude rather than include
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<TagKey>,
    /// User tags whose filters exclude rather than include
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_user_tags: Vec<String>,
    /// Explicit claim that the filter names exactly one tag group
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub single_tag_group: bool,
}

impl TagGroupFilterConfig {
    /// Filter values of a fixed dimension
    pub fn get(&self, key: TagKey) -> Option<&Vec<String>> {
        match key {
            TagKey::Account => self.account.as_ref(),
            TagKey::Region => self.region.as_ref(),
            TagKey::Zone => self.zone.as_ref(),
            TagKey::Product => self.product.as_ref(),
            TagKey::Operation => self.operation.as_ref(),
            TagKey::UsageType => self.usage_type.as_ref(),
        }
    }

    pub fn set(&mut self, key: TagKey, values: Option<Vec<String>>) {
        let slot = match key {
            TagKey::Account => &mut self.account,
            TagKey::Region => &mut self.region,
            TagKey::Zone => &mut self.zone,
            TagKey::Product => &mut self.product,
            TagKey::Operation => &mut self.operation,
            TagKey::UsageType => &mut self.usage_type,
        };
        *slot = values;
    }

    pub fn is_excluded(&self, key: TagKey) -> bool {
        self.exclude.contains(&key)
    }

    pub fn is_user_tag_excluded(&self, key: &str) -> bool {
        self.exclude_user_tags.iter().any(|k| k == key)
    }
}

/// Filter, grouping and resolution of one operand
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryConfig {
    pub filter: TagGroupFilterConfig,
    /// Fixed dimensions kept distinct, `None` means all of them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<TagKey>>,
    /// User tags kept distinct, `None` means all of them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by_tags: Option<Vec<String>>,
    /// Collapse the hours into a single monthly value
    pub monthly: bool,
}

/// Output tag group templates of a result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagGroupConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_type: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub user_tags: BTreeMap<String, String>,
}

impl TagGroupConfig {
    pub fn get(&self, key: TagKey) -> Option<&String> {
        match key {
            TagKey::Account => self.account.as_ref(),
            TagKey::Region => self.region.as_ref(),
            TagKey::Zone => self.zone.as_ref(),
            TagKey::Product => self.product.as_ref(),
            TagKey::Operation => self.operation.as_ref(),
            TagKey::UsageType => self.usage_type.as_ref(),
        }
    }
}

/// One computed output of a fixed rule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResultConfig {
    pub out: TagGroupConfig,
    /// Cost expression
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<String>,
    /// Usage expression
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<String>,
    /// Evaluate once instead of once per in aggregation
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub single: bool,
}

/// Tag mappings for one output key: destination value to source key matchers
///
/// A matcher is either a literal value or a regex prefixed with `re:`.
pub type TagMapConfig = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// Kubernetes cluster report settings of an allocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesConfig {
    /// Formulae producing candidate cluster names from user tags
    pub cluster_name_formulae: Vec<String>,
    /// Report column name to output user tag key
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub out: BTreeMap<String, String>,
    /// Explicit report file, otherwise located in the report directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
}

/// In-place allocation settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocationConfig {
    /// Input key to report column. Keys starting with `_` name fixed dimensions.
    #[serde(rename = "in")]
    pub in_keys: BTreeMap<String, String>,
    /// Output user tag key to report column
    pub out: BTreeMap<String, String>,
    /// Output key to tag mappings
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tag_maps: BTreeMap<String, TagMapConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesConfig>,
}

/// A post-processing rule document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleConfig {
    pub name: String,
    /// First month the rule applies to
    pub start: String,
    /// First month the rule no longer applies to
    pub end: String,
    #[serde(rename = "in", skip_serializing_if = "Option::is_none")]
    pub in_query: Option<QueryConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub operands: BTreeMap<String, QueryConfig>,
    /// Named regexes used by out templates
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub patterns: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<ResultConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationConfig>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RuleDocument {
    List(Vec<RuleConfig>),
    Wrapped { rules: Vec<RuleConfig> },
}

impl RuleDocument {
    fn into_rules(self) -> Vec<RuleConfig> {
        match self {
            RuleDocument::List(rules) => rules,
            RuleDocument::Wrapped { rules } => rules,
        }
    }
}

impl RuleConfig {
    /// Parse a YAML list of rules, or a mapping with a `rules` list
    pub fn from_yaml(s: &str) -> Result<Vec<RuleConfig>> {
        let doc: RuleDocument = serde_yaml::from_str(s)?;
        Ok(doc.into_rules())
    }

    /// Parse a JSON list of rules, or an object with a `rules` list
    pub fn from_json(s: &str) -> Result<Vec<RuleConfig>> {
        let doc: RuleDocument = serde_json::from_str(s)?;
        Ok(doc.into_rules())
    }

    /// Load rules from a `.yaml`, `.yml` or `.json` file
    pub fn load_file(path: impl AsRef<Path>) -> Result<Vec<RuleConfig>> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&contents),
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            other => Err(PostProcError::config(format!(
                "Unsupported rule file format: {}",
                other.unwrap_or("<none>")
            ))),
        }
    }

    pub fn start_date(&self) -> Result<DateTime<Utc>> {
        parse_date(&self.start).map_err(|e| {
            PostProcError::config(format!("Bad start date in rule {}: {}", self.name, e))
        })
    }

    pub fn end_date(&self) -> Result<DateTime<Utc>> {
        parse_date(&self.end).map_err(|e| {
            PostProcError::config(format!("Bad end date in rule {}: {}", self.name, e))
        })
    }

    /// Whether the half-open window `[start, end)` contains `period_start`
    pub fn is_active(&self, period_start: &DateTime<Utc>) -> Result<bool> {
        let start = self.start_date()?;
        let end = self.end_date()?;
        Ok(start <= *period_start && *period_start < end)
    }
}
