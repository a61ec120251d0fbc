//! Operand value cache
//!
//! One cache lives for one rule invocation. Both passes of the rule share it,
//! so a scalar operand such as a whole-account monthly total is scanned once.

use crate::aggregation::AggregationTagGroup;
use ice_model::CostAndUsage;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::ops::AddAssign;

/// Hit and miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

impl AddAssign for CacheStats {
    fn add_assign(&mut self, rhs: CacheStats) {
        self.hits += rhs.hits;
        self.misses += rhs.misses;
    }
}

/// Cached operand series
#[derive(Debug, Default)]
pub struct OperandCache {
    /// Single aggregation operands by canonical query
    single: HashMap<String, Vec<CostAndUsage>>,
    /// Grouped operands by canonical query, pass and aggregation key
    grouped: HashMap<(String, bool, AggregationTagGroup), Vec<CostAndUsage>>,
    /// Grouped operands already scanned, per pass
    scanned: HashSet<(String, bool)>,
    stats: CacheStats,
}

impl OperandCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of a single aggregation operand, counting the lookup
    pub fn get(&mut self, canonical: &str) -> Option<&Vec<CostAndUsage>> {
        match self.single.get(canonical) {
            Some(values) => {
                self.stats.hits += 1;
                Some(values)
            },
            None => {
                self.stats.misses += 1;
                None
            },
        }
    }

    pub fn insert(&mut self, canonical: &str, values: Vec<CostAndUsage>) {
        self.single.insert(canonical.to_string(), values);
    }

    /// Whether a grouped operand has been scanned for this pass, counting the lookup
    pub fn is_scanned(&mut self, canonical: &str, non_resource: bool) -> bool {
        let scanned = self.scanned.contains(&(canonical.to_string(), non_resource));
        if scanned {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
        scanned
    }

    /// Store every aggregation of a grouped operand scan
    pub fn insert_grouped(
        &mut self,
        canonical: &str,
        non_resource: bool,
        values: impl IntoIterator<Item = (AggregationTagGroup, Vec<CostAndUsage>)>,
    ) {
        for (atg, v) in values {
            self.grouped.insert((canonical.to_string(), non_resource, atg), v);
        }
        self.scanned.insert((canonical.to_string(), non_resource));
    }

    pub fn get_grouped(
        &self,
        canonical: &str,
        non_resource: bool,
        atg: &AggregationTagGroup,
    ) -> Option<&Vec<CostAndUsage>> {
        self.grouped.get(&(canonical.to_string(), non_resource, atg.clone()))
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
