//! Compiled operand queries
//!
//! A [`Query`] is the executable form of a [`QueryConfig`]: one regex filter
//! per fixed dimension and per filtered user tag, plus the group-by policy
//! that maps matching tag groups onto [`AggregationTagGroup`] keys.

use crate::aggregation::{Aggregation, AggregationTagGroup};
use crate::config::{QueryConfig, TagGroupFilterConfig};
use crate::error::{PostProcError, Result};
use crate::processor::MetadataServices;
use ice_model::{CostAndUsageData, ResourceGroup, TagGroup, TagKey};
use regex::Regex;
use std::fmt;

/// One full-match pattern
#[derive(Debug)]
struct TagFilter {
    source: String,
    regex: Regex,
}

impl TagFilter {
    fn new(source: &str) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{})$", source)).map_err(|e| {
            PostProcError::config(format!("Bad tag filter pattern \"{}\": {}", source, e))
        })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    fn matches(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

/// Include or exclude filter over one dimension
#[derive(Debug)]
struct TagFilters {
    exclude: bool,
    filters: Vec<TagFilter>,
}

impl TagFilters {
    fn new(values: &[String], exclude: bool) -> Result<Self> {
        Ok(Self {
            exclude,
            filters: values.iter().map(|v| TagFilter::new(v)).collect::<Result<_>>()?,
        })
    }

    fn matches(&self, value: &str) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        let any = self.filters.iter().any(|f| f.matches(value));
        any != self.exclude
    }

    /// Names exactly one value
    fn is_single(&self) -> bool {
        !self.exclude && self.filters.len() == 1
    }

    fn first(&self) -> Option<&str> {
        self.filters.first().map(|f| f.source.as_str())
    }
}

impl fmt::Display for TagFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: Vec<&str> = self.filters.iter().map(|t| t.source.as_str()).collect();
        let mode = if self.exclude { "exclude" } else { "include" };
        write!(f, "{}: [{}]", mode, values.join(","))
    }
}

struct UserTagFilter {
    index: usize,
    key: String,
    filters: TagFilters,
}

/// Compiled operand
pub struct Query {
    tag_filters: [Option<TagFilters>; 6],
    user_tag_filters: Vec<UserTagFilter>,
    num_user_tags: usize,
    single_tag_group: bool,
    monthly: bool,
    group_by: Vec<TagKey>,
    group_by_tags: Vec<String>,
    aggregation: Aggregation,
    aggregates: bool,
    canonical: String,
}

impl Query {
    /// Compile a query against the data set's user tag keys
    pub fn new(config: &QueryConfig, user_tag_keys: &[String]) -> Result<Self> {
        let filter = &config.filter;
        let mut tag_filters: [Option<TagFilters>; 6] = Default::default();
        for k in TagKey::ALL {
            tag_filters[k.index()] = filter
                .get(k)
                .map(|values| TagFilters::new(values, filter.is_excluded(k)))
                .transpose()?;
        }

        let mut user_tag_filters = Vec::with_capacity(filter.user_tags.len());
        for (key, values) in &filter.user_tags {
            let index = user_tag_index(user_tag_keys, key)?;
            user_tag_filters.push(UserTagFilter {
                index,
                key: key.clone(),
                filters: TagFilters::new(values, filter.is_user_tag_excluded(key))?,
            });
        }

        let group_by = config
            .group_by
            .clone()
            .unwrap_or_else(|| TagKey::ALL.to_vec());
        let group_by_tags = config
            .group_by_tags
            .clone()
            .unwrap_or_else(|| user_tag_keys.to_vec());
        let group_by_tag_indices = group_by_tags
            .iter()
            .map(|k| user_tag_index(user_tag_keys, k))
            .collect::<Result<Vec<_>>>()?;
        let aggregation = Aggregation::new(&group_by, &group_by_tag_indices);
        let aggregates = TagKey::ALL.iter().any(|k| !aggregation.groups(*k))
            || (0..user_tag_keys.len()).any(|i| !aggregation.groups_tag(i));

        let single_tag_group = Self::resolves_to_single(filter, &tag_filters, &user_tag_filters, user_tag_keys.len())?;

        let mut query = Self {
            tag_filters,
            user_tag_filters,
            num_user_tags: user_tag_keys.len(),
            single_tag_group,
            monthly: config.monthly,
            group_by,
            group_by_tags,
            aggregation,
            aggregates,
            canonical: String::new(),
        };
        query.canonical = query.describe();
        Ok(query)
    }

    fn resolves_to_single(
        filter: &TagGroupFilterConfig,
        tag_filters: &[Option<TagFilters>; 6],
        user_tag_filters: &[UserTagFilter],
        num_user_tags: usize,
    ) -> Result<bool> {
        let given_are_single = tag_filters.iter().flatten().all(TagFilters::is_single)
            && user_tag_filters.iter().all(|f| f.filters.is_single());
        let has = |k: TagKey| tag_filters[k.index()].is_some();

        if filter.single_tag_group {
            let required = has(TagKey::Account) && has(TagKey::Region) && has(TagKey::Product);
            if !given_are_single || !required {
                return Err(PostProcError::config(
                    "Query filter marked as single, but resolves to more than one tag group.",
                ));
            }
            return Ok(true);
        }
        Ok(given_are_single
            && TagKey::ALL.iter().all(|k| has(*k))
            && user_tag_filters.len() == num_user_tags)
    }

    fn describe(&self) -> String {
        let mut parts: Vec<String> = TagKey::ALL
            .iter()
            .filter_map(|k| {
                self.tag_filters[k.index()]
                    .as_ref()
                    .map(|f| format!("{}:{{{}}}", k.name(), f))
            })
            .collect();
        parts.extend(
            self.user_tag_filters
                .iter()
                .map(|f| format!("userTag.{}:{{{}}}", f.key, f.filters)),
        );
        let group_by: Vec<&str> = self.group_by.iter().map(|k| k.name()).collect();
        parts.push(format!("groupBy:[{}]", group_by.join(",")));
        parts.push(format!("groupByTags:[{}]", self.group_by_tags.join(",")));
        if self.monthly {
            parts.push("monthly".to_string());
        }
        if self.single_tag_group {
            parts.push("single".to_string());
        }
        parts.join(",")
    }

    /// Canonical description, used as the operand cache key
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn aggregation(&self) -> &Aggregation {
        &self.aggregation
    }

    pub fn group_by(&self) -> &[TagKey] {
        &self.group_by
    }

    pub fn group_by_tags(&self) -> &[String] {
        &self.group_by_tags
    }

    /// Whether any fixed dimension or user tag is collapsed
    pub fn has_aggregation(&self) -> bool {
        self.aggregates
    }

    pub fn is_monthly(&self) -> bool {
        self.monthly
    }

    pub fn is_single_tag_group(&self) -> bool {
        self.single_tag_group
    }

    /// Whether the whole result collapses to one series
    pub fn is_single_aggregation(&self) -> bool {
        self.single_tag_group || (self.group_by.is_empty() && self.group_by_tags.is_empty())
    }

    pub fn num_user_tags(&self) -> usize {
        self.num_user_tags
    }

    pub fn matches_product(&self, service_code: &str) -> bool {
        self.tag_filters[TagKey::Product.index()]
            .as_ref()
            .map_or(true, |f| f.matches(service_code))
    }

    /// Products of the data set that pass the product filter
    pub fn products(&self, data: &CostAndUsageData) -> Vec<String> {
        data.products()
            .into_iter()
            .filter(|p| self.matches_product(p))
            .collect()
    }

    /// Whether a tag group passes every filter
    pub fn matches(&self, tg: &TagGroup) -> bool {
        for key in TagKey::ALL {
            let Some(filters) = &self.tag_filters[key.index()] else {
                continue;
            };
            match tg.value(key) {
                Some(value) if filters.matches(value) => {},
                _ => return false,
            }
        }
        match &tg.resource_group {
            Some(rg) => self
                .user_tag_filters
                .iter()
                .all(|f| f.filters.matches(rg.get(f.index))),
            None => true,
        }
    }

    /// Aggregation key of a matching tag group
    pub fn aggregate_tag_group(&self, tg: &TagGroup) -> Option<AggregationTagGroup> {
        self.matches(tg).then(|| self.aggregation.aggregate(tg))
    }

    /// The one tag group a single tag group query names
    ///
    /// Unspecified operation and usage type are empty, unspecified user tags
    /// are unset. Non-resource lookups carry no resource group.
    pub fn single_tag_group(&self, services: &MetadataServices, non_resource: bool) -> Result<TagGroup> {
        if !self.single_tag_group {
            return Err(PostProcError::config(format!(
                "Query does not name a single tag group: {}",
                self.canonical
            )));
        }
        let first = |k: TagKey| {
            self.tag_filters[k.index()]
                .as_ref()
                .and_then(|f| f.first())
                .unwrap_or("")
        };
        let account = services.accounts.get_account_by_id(first(TagKey::Account));
        let product = services
            .products
            .get_product_by_service_code(first(TagKey::Product));
        let zone = self.tag_filters[TagKey::Zone.index()]
            .as_ref()
            .and_then(|f| f.first())
            .map(str::to_string);
        let resource_group = (!non_resource).then(|| {
            let mut rg = ResourceGroup::empty(self.num_user_tags);
            for f in &self.user_tag_filters {
                rg = rg.with_value(f.index, f.filters.first().unwrap_or(""));
            }
            rg
        });
        Ok(TagGroup::new(
            account.id,
            first(TagKey::Region),
            zone,
            product.service_code,
            first(TagKey::Operation),
            first(TagKey::UsageType),
            resource_group,
        ))
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Query").field(&self.canonical).finish()
    }
}

fn user_tag_index(user_tag_keys: &[String], key: &str) -> Result<usize> {
    user_tag_keys
        .iter()
        .position(|k| k == key)
        .ok_or_else(|| PostProcError::config(format!("Invalid user tag key name: \"{}\"", key)))
}
