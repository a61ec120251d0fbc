//! Compiled rules
//!
//! A [`Rule`] is validated once, before any data is touched: every operand
//! query compiles, every expression placeholder names a known operand, every
//! out template names a known pattern, and an allocation never needs a
//! dimension its in operand collapsed.

use crate::aggregation::AggregationTagGroup;
use crate::allocation_report::{allocation_tag_key, AllocationReport};
use crate::cluster_report::KubernetesReport;
use crate::config::{AllocationConfig, ResultConfig, RuleConfig};
use crate::error::{PostProcError, Result};
use crate::expression::{placeholders, Expression};
use crate::processor::MetadataServices;
use crate::query::Query;
use chrono::{DateTime, Utc};
use ice_model::{ResourceGroup, TagGroup, TagKey};
use regex::Regex;
use std::collections::BTreeMap;

/// What a rule produces
pub enum RuleKind {
    /// Computed tag groups
    Results(Vec<ResultSpec>),
    /// In-place redistribution of the in tag groups
    Allocation(AllocationConfig),
}

/// Named regex for out templates
struct Pattern {
    regex: Regex,
    has_groups: bool,
}

/// Compiled post-processing rule
pub struct Rule {
    config: RuleConfig,
    user_tag_keys: Vec<String>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    in_query: Query,
    operands: BTreeMap<String, Query>,
    patterns: BTreeMap<String, Pattern>,
    kind: RuleKind,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("config", &self.config)
            .field("in_query", &self.in_query)
            .field("operands", &self.operands)
            .finish_non_exhaustive()
    }
}

impl Rule {
    pub fn new(config: RuleConfig, user_tag_keys: &[String]) -> Result<Self> {
        let name = config.name.clone();
        let Some(in_config) = config.in_query.as_ref() else {
            return Err(missing_parameters(&name));
        };
        if name.is_empty()
            || config.start.is_empty()
            || config.end.is_empty()
            || config.results.is_some() == config.allocation.is_some()
        {
            return Err(missing_parameters(&name));
        }
        let start = config.start_date()?;
        let end = config.end_date()?;

        let in_query = Query::new(in_config, user_tag_keys)
            .map_err(|e| in_rule(&name, "in operand", e))?;
        let mut operands = BTreeMap::new();
        for (op_name, op_config) in &config.operands {
            let query = Query::new(op_config, user_tag_keys)
                .map_err(|e| in_rule(&name, &format!("operand \"{}\"", op_name), e))?;
            operands.insert(op_name.clone(), query);
        }

        let mut patterns = BTreeMap::new();
        for (p_name, source) in &config.patterns {
            let regex = Regex::new(&format!("^(?:{})$", source)).map_err(|e| {
                PostProcError::config(format!(
                    "Bad pattern \"{}\" in rule \"{}\": {}",
                    p_name, name, e
                ))
            })?;
            let has_groups = regex.captures_len() > 1;
            patterns.insert(p_name.clone(), Pattern { regex, has_groups });
        }

        let kind = match (&config.results, &config.allocation) {
            (Some(results), None) => {
                let specs = results
                    .iter()
                    .map(|rc| ResultSpec::new(rc, &name, &config, user_tag_keys))
                    .collect::<Result<Vec<_>>>()?;
                RuleKind::Results(specs)
            },
            (None, Some(allocation)) => RuleKind::Allocation(allocation.clone()),
            _ => return Err(missing_parameters(&name)),
        };

        let rule = Self {
            config,
            user_tag_keys: user_tag_keys.to_vec(),
            start,
            end,
            in_query,
            operands,
            patterns,
            kind,
        };
        rule.validate()?;
        Ok(rule)
    }

    fn validate(&self) -> Result<()> {
        match &self.kind {
            RuleKind::Results(specs) => {
                for spec in specs {
                    for template in spec.templates() {
                        for (_, pattern) in placeholders(template) {
                            if !self.patterns.contains_key(pattern) {
                                return Err(PostProcError::config(format!(
                                    "Post-processor rule {} references unknown pattern \"{}\" in template \"{}\"",
                                    self.name(),
                                    pattern,
                                    template
                                )));
                            }
                        }
                    }
                }
                self.validate_grouped_operands()
            },
            RuleKind::Allocation(allocation) => self.validate_allocation(allocation),
        }
    }

    /// Grouped operands are looked up by the in aggregation, so they may only
    /// group dimensions the in operand keeps.
    fn validate_grouped_operands(&self) -> Result<()> {
        for (name, op) in &self.operands {
            if op.is_single_aggregation() {
                continue;
            }
            let dims_kept = op
                .group_by()
                .iter()
                .all(|k| self.in_query.group_by().contains(k));
            let tags_kept = op
                .group_by_tags()
                .iter()
                .all(|t| self.in_query.group_by_tags().contains(t));
            if !dims_kept || !tags_kept {
                return Err(PostProcError::config(format!(
                    "Unsupported configuration in rule {}: operand \"{}\" has more than a single aggregated value per hour.",
                    self.name(),
                    name
                )));
            }
        }
        Ok(())
    }

    fn validate_allocation(&self, allocation: &AllocationConfig) -> Result<()> {
        for key in allocation.in_keys.keys() {
            if key.starts_with('_') {
                let tag_key = allocation_tag_key(key)?;
                if !self.in_query.group_by().contains(&tag_key) {
                    return Err(PostProcError::config(format!(
                        "Post-processor rule {} has allocation report that references aggregated tag key: {}",
                        self.name(),
                        tag_key
                    )));
                }
            } else if !self.in_query.group_by_tags().contains(key) {
                return Err(PostProcError::config(format!(
                    "Post-processor rule {} has allocation report that references aggregated user tag key: {}",
                    self.name(),
                    key
                )));
            }
        }
        self.new_allocation_report(self.start)?;
        if allocation.kubernetes.is_some() {
            KubernetesReport::new(allocation, self.start, &self.user_tag_keys)?;
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    pub fn user_tag_keys(&self) -> &[String] {
        &self.user_tag_keys
    }

    pub fn start(&self) -> &DateTime<Utc> {
        &self.start
    }

    pub fn end(&self) -> &DateTime<Utc> {
        &self.end
    }

    pub fn is_active(&self, period_start: &DateTime<Utc>) -> bool {
        self.start <= *period_start && *period_start < self.end
    }

    pub fn in_query(&self) -> &Query {
        &self.in_query
    }

    pub fn operands(&self) -> &BTreeMap<String, Query> {
        &self.operands
    }

    pub fn operand(&self, name: &str) -> Option<&Query> {
        self.operands.get(name)
    }

    pub fn kind(&self) -> &RuleKind {
        &self.kind
    }

    pub fn results(&self) -> &[ResultSpec] {
        match &self.kind {
            RuleKind::Results(specs) => specs,
            RuleKind::Allocation(_) => &[],
        }
    }

    pub fn allocation(&self) -> Option<&AllocationConfig> {
        match &self.kind {
            RuleKind::Allocation(allocation) => Some(allocation),
            RuleKind::Results(_) => None,
        }
    }

    /// Empty allocation report for the month starting at `start`
    pub fn new_allocation_report(&self, start: DateTime<Utc>) -> Result<AllocationReport> {
        let allocation = self.allocation().ok_or_else(|| {
            PostProcError::config(format!("Rule {} has no allocation", self.name()))
        })?;
        AllocationReport::new(allocation, start, &self.user_tag_keys)
            .map_err(|e| in_rule(self.name(), "allocation", e))
    }

    /// Capture of a named pattern against a value
    ///
    /// Returns group 1, or the whole match when the pattern has no groups.
    /// No value or no match gives "".
    pub fn pattern_value(&self, pattern: &str, value: Option<&str>) -> String {
        let (Some(p), Some(value)) = (self.patterns.get(pattern), value) else {
            return String::new();
        };
        p.regex
            .captures(value)
            .and_then(|caps| caps.get(if p.has_groups { 1 } else { 0 }))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    }

    /// Fill the `${pattern}` placeholders of an out template from `value`
    pub fn expand_template(&self, template: &str, value: Option<&str>) -> String {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for (range, pattern) in placeholders(template) {
            out.push_str(&template[last..range.start]);
            out.push_str(&self.pattern_value(pattern, value));
            last = range.end;
        }
        out.push_str(&template[last..]);
        out
    }
}

fn missing_parameters(name: &str) -> PostProcError {
    PostProcError::config(format!(
        "Missing required parameters in post processor rule config for {}. Must have: name, start, end, in, and either results or allocation, but not both",
        name
    ))
}

/// Prefix a construction error with the rule and the part that failed
fn in_rule(rule: &str, part: &str, err: PostProcError) -> PostProcError {
    let msg = match err {
        PostProcError::Config(msg) => msg,
        other => other.to_string(),
    };
    PostProcError::config(format!("Error with rule \"{}\" and {}: {}", rule, part, msg))
}

/// One output of a fixed rule
pub struct ResultSpec {
    config: ResultConfig,
    user_tags: Vec<(usize, String)>,
    cost: Option<Expression>,
    usage: Option<Expression>,
}

impl ResultSpec {
    fn new(
        config: &ResultConfig,
        rule_name: &str,
        rule: &RuleConfig,
        user_tag_keys: &[String],
    ) -> Result<Self> {
        let operand_names = rule.operands.keys().map(String::as_str);
        let parse = |source: &Option<String>| {
            source
                .as_deref()
                .map(|s| {
                    Expression::parse(s, operand_names.clone())
                        .map_err(|e| in_rule(rule_name, "result", e))
                })
                .transpose()
        };
        let cost = parse(&config.cost)?;
        let usage = parse(&config.usage)?;

        let mut user_tags = Vec::with_capacity(config.out.user_tags.len());
        for (key, template) in &config.out.user_tags {
            let index = user_tag_keys.iter().position(|k| k == key).ok_or_else(|| {
                PostProcError::config(format!(
                    "Invalid user tag key name: \"{}\" in result of rule {}",
                    key, rule_name
                ))
            })?;
            user_tags.push((index, template.clone()));
        }

        Ok(Self {
            config: config.clone(),
            user_tags,
            cost,
            usage,
        })
    }

    pub fn is_single(&self) -> bool {
        self.config.single
    }

    pub fn cost(&self) -> Option<&Expression> {
        self.cost.as_ref()
    }

    pub fn usage(&self) -> Option<&Expression> {
        self.usage.as_ref()
    }

    pub fn config(&self) -> &ResultConfig {
        &self.config
    }

    fn templates(&self) -> impl Iterator<Item = &str> {
        TagKey::ALL
            .iter()
            .filter_map(|k| self.config.out.get(*k).map(String::as_str))
            .chain(self.user_tags.iter().map(|(_, t)| t.as_str()))
    }

    /// Output tag group for one in aggregation, or for no aggregation when
    /// the result is single
    ///
    /// Out templates override the aggregation's values; dimensions with
    /// neither are empty. Non-resource output carries no resource group.
    pub fn tag_group(
        &self,
        rule: &Rule,
        atg: Option<&AggregationTagGroup>,
        services: &MetadataServices,
        non_resource: bool,
    ) -> TagGroup {
        let value = |key: TagKey| -> Option<String> {
            let current = atg.and_then(|a| a.value(key));
            match self.config.out.get(key) {
                Some(template) => Some(rule.expand_template(template, current)),
                None => current.map(str::to_string),
            }
        };

        let account = services
            .accounts
            .get_account_by_id(&value(TagKey::Account).unwrap_or_default());
        let product = services
            .products
            .get_product_by_service_code(&value(TagKey::Product).unwrap_or_default());
        let zone = value(TagKey::Zone).filter(|z| !z.is_empty());

        let resource_group = if non_resource {
            None
        } else {
            let num_user_tags = rule.user_tag_keys().len();
            let mut rg = atg
                .and_then(|a| a.resource_group(num_user_tags))
                .unwrap_or_else(|| ResourceGroup::empty(num_user_tags));
            for (index, template) in &self.user_tags {
                let current = atg.and_then(|a| a.user_tag(*index));
                rg = rg.with_value(*index, rule.expand_template(template, current));
            }
            Some(rg)
        };

        TagGroup::new(
            account.id,
            value(TagKey::Region).unwrap_or_default(),
            zone,
            product.service_code,
            value(TagKey::Operation).unwrap_or_default(),
            value(TagKey::UsageType).unwrap_or_default(),
            resource_group,
        )
    }
}
