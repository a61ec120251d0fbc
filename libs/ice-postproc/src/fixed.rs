//! Fixed rule processor
//!
//! Evaluates the result expressions of a rule once per in aggregation (or
//! once for a single result) and overwrites the output tag groups. The rule
//! runs twice, over non-resource data then over resource data, and both
//! passes share one operand cache.

use crate::aggregation::AggregationTagGroup;
use crate::cache::{CacheStats, OperandCache};
use crate::error::{PostProcError, Result};
use crate::expression::Expression;
use crate::processor::{run_query, MetadataServices, QueryResult, RuleProcessor};
use crate::rule::{ResultSpec, Rule};
use crate::stats::{elapsed_info, PostProcessorStats, RuleType};
use ice_calc::Formula;
use ice_model::{CostAndUsage, CostAndUsageData, TagGroup};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use tracing::{debug, error, info};

type Outputs = BTreeMap<TagGroup, Vec<CostAndUsage>>;

/// Applies a rule with `results`
pub struct FixedRuleProcessor<'a> {
    rule: &'a Rule,
    services: &'a MetadataServices,
    cache: OperandCache,
}

impl<'a> FixedRuleProcessor<'a> {
    pub fn new(rule: &'a Rule, services: &'a MetadataServices) -> Self {
        Self {
            rule,
            services,
            cache: OperandCache::new(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Run one pass, writing the outputs of each result as it completes
    ///
    /// A result that fails at any hour writes nothing, and the error ends the
    /// rule. Results before it in the same pass, and the whole non-resource
    /// pass when the resource pass fails, stay written.
    fn process_pass(&mut self, data: &mut CostAndUsageData, non_resource: bool) -> Result<PostProcessorStats> {
        let started = Instant::now();
        let name = self.rule.name();
        let max_hours = data.max_num();

        let in_data = run_query(self.rule.in_query(), data, self.services, non_resource, max_hours, name)?;
        let singles = self.single_operand_values(data, non_resource, max_hours)?;
        self.scan_grouped_operands(data, non_resource, max_hours)?;

        let mut out_count = 0;
        for spec in self.rule.results() {
            let outputs = self.apply_result(spec, &in_data, &singles, non_resource, max_hours)?;
            out_count += outputs.len();
            write_outputs(data, outputs, non_resource);
        }

        info!(
            "  -- data for rule {} -- in data size = {}, --- results size = {}",
            name,
            in_data.len(),
            out_count
        );
        Ok(PostProcessorStats::new(
            name,
            RuleType::Fixed,
            non_resource,
            in_data.len(),
            out_count,
            elapsed_info(started.elapsed()),
        ))
    }

    /// Values of the operands that reduce to one series
    fn single_operand_values(
        &mut self,
        data: &CostAndUsageData,
        non_resource: bool,
        max_hours: usize,
    ) -> Result<HashMap<String, Vec<CostAndUsage>>> {
        let mut values = HashMap::new();
        for (op_name, query) in self.rule.operands() {
            if !query.is_single_aggregation() {
                continue;
            }
            if let Some(cached) = self.cache.get(query.canonical()) {
                debug!("Found values in cache for operand \"{}\"", op_name);
                values.insert(op_name.clone(), cached.clone());
                continue;
            }

            let result = run_query(query, data, self.services, non_resource, max_hours, self.rule.name())?;
            if result.len() > 1 {
                return Err(PostProcError::config(format!(
                    "Single value operand \"{}\" has more than one tag group.",
                    op_name
                )));
            }
            let slots = if query.is_monthly() { 1 } else { max_hours };
            let series = result
                .into_values()
                .next()
                .unwrap_or_else(|| vec![CostAndUsage::ZERO; slots]);
            if query.is_monthly() {
                info!(
                    "  -- single monthly operand {} has value {:?}",
                    op_name,
                    series.first()
                );
            }
            self.cache.insert(query.canonical(), series.clone());
            values.insert(op_name.clone(), series);
        }
        Ok(values)
    }

    /// Scan the grouped operands into the cache once per pass
    fn scan_grouped_operands(&mut self, data: &CostAndUsageData, non_resource: bool, max_hours: usize) -> Result<()> {
        for query in self.rule.operands().values() {
            if query.is_single_aggregation() || self.cache.is_scanned(query.canonical(), non_resource) {
                continue;
            }
            let result = run_query(query, data, self.services, non_resource, max_hours, self.rule.name())?;
            self.cache.insert_grouped(query.canonical(), non_resource, result);
        }
        Ok(())
    }

    /// Operand series visible from one in aggregation
    fn operand_values<'v>(
        &'v self,
        singles: &'v HashMap<String, Vec<CostAndUsage>>,
        atg: Option<&AggregationTagGroup>,
        non_resource: bool,
    ) -> HashMap<&'v str, &'v [CostAndUsage]> {
        let mut values = HashMap::with_capacity(self.rule.operands().len());
        for (op_name, query) in self.rule.operands() {
            let series = if query.is_single_aggregation() {
                singles.get(op_name)
            } else {
                atg.and_then(|a| {
                    let key = query.aggregation().project(a);
                    self.cache.get_grouped(query.canonical(), non_resource, &key)
                })
            };
            if let Some(series) = series {
                values.insert(op_name.as_str(), series.as_slice());
            }
        }
        values
    }

    fn apply_result(
        &self,
        spec: &ResultSpec,
        in_data: &QueryResult,
        singles: &HashMap<String, Vec<CostAndUsage>>,
        non_resource: bool,
        max_hours: usize,
    ) -> Result<Outputs> {
        let mut outputs = Outputs::new();
        if spec.cost().is_none() && spec.usage().is_none() {
            return Ok(outputs);
        }
        let mut cost_formula = self.compile(spec.cost())?;
        let mut usage_formula = self.compile(spec.usage())?;

        let inputs: Vec<(Option<&AggregationTagGroup>, Option<&[CostAndUsage]>)> = if spec.is_single() {
            vec![(None, None)]
        } else {
            in_data
                .iter()
                .map(|(atg, values)| (Some(atg), Some(values.as_slice())))
                .collect()
        };

        for (atg, in_values) in inputs {
            let out_tg = spec.tag_group(self.rule, atg, self.services, non_resource);
            let operands = self.operand_values(singles, atg, non_resource);
            let hours = in_values.map_or(max_hours, <[CostAndUsage]>::len);
            let series = outputs
                .entry(out_tg)
                .or_insert_with(|| vec![CostAndUsage::ZERO; hours]);
            if series.len() < hours {
                series.resize(hours, CostAndUsage::ZERO);
            }

            for hour in 0..hours {
                let in_value = in_values
                    .and_then(|v| v.get(hour))
                    .copied()
                    .unwrap_or(CostAndUsage::ZERO);
                let cost = match (spec.cost(), cost_formula.as_mut()) {
                    (Some(expr), Some(formula)) => self.evaluate(expr, formula, in_value, &operands, hour)?,
                    _ => 0.0,
                };
                let usage = match (spec.usage(), usage_formula.as_mut()) {
                    (Some(expr), Some(formula)) => self.evaluate(expr, formula, in_value, &operands, hour)?,
                    _ => 0.0,
                };
                series[hour] += CostAndUsage::new(cost, usage);
            }
        }
        Ok(outputs)
    }

    fn compile(&self, expr: Option<&Expression>) -> Result<Option<Formula>> {
        expr.map(|e| {
            e.compile().map_err(|err| {
                error!(
                    "Error compiling expression \"{}\" for rule {}: {}",
                    e.source(),
                    self.rule.name(),
                    err
                );
                PostProcError::Evaluation {
                    rule: self.rule.name().to_string(),
                    expression: e.source().to_string(),
                    hour: 0,
                    message: err.to_string(),
                }
            })
        })
        .transpose()
    }

    fn evaluate(
        &self,
        expr: &Expression,
        formula: &mut Formula,
        in_value: CostAndUsage,
        operands: &HashMap<&str, &[CostAndUsage]>,
        hour: usize,
    ) -> Result<f64> {
        let values = expr.bindings(in_value, operands, hour);
        expr.evaluate(formula, &values).map_err(|err| {
            let expanded = expr.expand(&values);
            error!(
                "Error processing expression \"{}\" for rule {} at hour {}: {}",
                expanded,
                self.rule.name(),
                hour,
                err
            );
            PostProcError::Evaluation {
                rule: self.rule.name().to_string(),
                expression: expanded,
                hour,
                message: err.to_string(),
            }
        })
    }
}

/// Overwrite each output series. A zero value clears the hour.
///
/// Called only with the complete series of a result, so a result is either
/// written for every hour or not at all.
fn write_outputs(data: &mut CostAndUsageData, outputs: Outputs, non_resource: bool) {
    for (tg, series) in outputs {
        let product = if non_resource { None } else { Some(tg.product.clone()) };
        let store = data.get_or_create(product.as_deref());
        for (hour, value) in series.into_iter().enumerate() {
            if value.is_zero() {
                store.remove(hour, &tg);
            } else {
                store.put(hour, tg.clone(), value);
            }
        }
    }
}

impl RuleProcessor for FixedRuleProcessor<'_> {
    fn process(&mut self, data: &mut CostAndUsageData) -> Result<Vec<PostProcessorStats>> {
        let mut stats = Vec::with_capacity(2);

        info!("Post-process with rule {} on non-resource data", self.rule.name());
        stats.push(self.process_pass(data, true)?);

        info!("Post-process with rule {} on resource data", self.rule.name());
        stats.push(self.process_pass(data, false)?);

        Ok(stats)
    }
}
