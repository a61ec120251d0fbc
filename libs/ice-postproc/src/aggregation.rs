//! Aggregation keys
//!
//! An [`Aggregation`] keeps some dimensions of a tag group distinct and
//! collapses the rest to a wildcard. The reduced key is an
//! [`AggregationTagGroup`]; two tag groups aggregate together iff they agree
//! on every grouped dimension.

use ice_model::{ResourceGroup, TagGroup, TagKey};
use std::fmt;

/// Value of one fixed dimension inside an aggregation key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Dim {
    /// Collapsed
    Any,
    /// Grouped, `None` only for an absent zone
    Value(Option<String>),
}

impl Dim {
    fn as_str(&self) -> Option<&str> {
        match self {
            Dim::Any => None,
            Dim::Value(v) => v.as_deref(),
        }
    }
}

/// Reduced tag group used as the aggregation key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationTagGroup {
    dims: [Dim; 6],
    /// `None` for non-resource data, otherwise one entry per user tag with
    /// `None` where the tag is collapsed
    user_tags: Option<Vec<Option<String>>>,
}

impl AggregationTagGroup {
    /// Value of a grouped dimension. `None` if the dimension is collapsed or
    /// the zone is absent.
    pub fn value(&self, key: TagKey) -> Option<&str> {
        self.dims[key.index()].as_str()
    }

    pub fn is_grouped(&self, key: TagKey) -> bool {
        self.dims[key.index()] != Dim::Any
    }

    /// Value of a grouped user tag, `None` if collapsed or non-resource
    pub fn user_tag(&self, index: usize) -> Option<&str> {
        self.user_tags
            .as_ref()
            .and_then(|tags| tags.get(index))
            .and_then(|v| v.as_deref())
    }

    pub fn is_resource(&self) -> bool {
        self.user_tags.is_some()
    }

    /// Resource group with collapsed user tags left unset
    pub fn resource_group(&self, num_user_tags: usize) -> Option<ResourceGroup> {
        self.user_tags.as_ref().map(|_| {
            ResourceGroup::new(
                (0..num_user_tags)
                    .map(|i| self.user_tag(i).unwrap_or("").to_string())
                    .collect(),
            )
        })
    }

    /// Concrete tag group with collapsed dimensions left empty
    pub fn tag_group(&self, num_user_tags: usize) -> TagGroup {
        let zone = match &self.dims[TagKey::Zone.index()] {
            Dim::Value(Some(zone)) => Some(zone.clone()),
            _ => None,
        };
        TagGroup::new(
            self.value(TagKey::Account).unwrap_or(""),
            self.value(TagKey::Region).unwrap_or(""),
            zone,
            self.value(TagKey::Product).unwrap_or(""),
            self.value(TagKey::Operation).unwrap_or(""),
            self.value(TagKey::UsageType).unwrap_or(""),
            self.resource_group(num_user_tags),
        )
    }
}

impl fmt::Display for AggregationTagGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = TagKey::ALL
            .iter()
            .map(|k| match &self.dims[k.index()] {
                Dim::Any => "*".to_string(),
                Dim::Value(v) => v.clone().unwrap_or_default(),
            })
            .collect();
        if let Some(tags) = &self.user_tags {
            parts.extend(tags.iter().map(|t| t.clone().unwrap_or_else(|| "*".to_string())));
        }
        write!(f, "[{}]", parts.join(","))
    }
}

/// Group-by policy of a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregation {
    group_by: [bool; 6],
    group_by_tags: Vec<usize>,
}

impl Aggregation {
    pub fn new(group_by: &[TagKey], group_by_tags: &[usize]) -> Self {
        let mut grouped = [false; 6];
        for key in group_by {
            grouped[key.index()] = true;
        }
        let mut tags = group_by_tags.to_vec();
        tags.sort_unstable();
        tags.dedup();
        Self {
            group_by: grouped,
            group_by_tags: tags,
        }
    }

    pub fn groups(&self, key: TagKey) -> bool {
        self.group_by[key.index()]
    }

    pub fn groups_tag(&self, index: usize) -> bool {
        self.group_by_tags.binary_search(&index).is_ok()
    }

    /// Reduce a tag group to its aggregation key
    pub fn aggregate(&self, tg: &TagGroup) -> AggregationTagGroup {
        let dims = TagKey::ALL.map(|k| {
            if !self.groups(k) {
                Dim::Any
            } else if k == TagKey::Zone {
                Dim::Value(tg.zone.clone())
            } else {
                Dim::Value(tg.value(k).map(str::to_string))
            }
        });
        let user_tags = tg.resource_group.as_ref().map(|rg| {
            (0..rg.len())
                .map(|i| self.groups_tag(i).then(|| rg.get(i).to_string()))
                .collect()
        });
        AggregationTagGroup { dims, user_tags }
    }

    /// Reduce another aggregation key, which must group at least the
    /// dimensions this policy groups
    pub fn project(&self, atg: &AggregationTagGroup) -> AggregationTagGroup {
        let dims = TagKey::ALL.map(|k| {
            if self.groups(k) {
                atg.dims[k.index()].clone()
            } else {
                Dim::Any
            }
        });
        let user_tags = atg.user_tags.as_ref().map(|tags| {
            tags.iter()
                .enumerate()
                .map(|(i, v)| if self.groups_tag(i) { v.clone() } else { None })
                .collect()
        });
        AggregationTagGroup { dims, user_tags }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn tg(account: &str, usage_type: &str, tags: &[&str]) -> TagGroup {
        TagGroup::new(
            account,
            "us-east-1",
            Some("us-east-1a".to_string()),
            "EC2Instance",
            "RunInstances",
            usage_type,
            Some(ResourceGroup::new(tags.iter().map(|t| t.to_string()).collect())),
        )
    }

    #[test]
    fn test_tag_groups_agreeing_on_group_by_collide() {
        let agg = Aggregation::new(&[TagKey::Account], &[1]);
        let a = agg.aggregate(&tg("111", "m5.large", &["prod", "web"]));
        let b = agg.aggregate(&tg("111", "c5.xlarge", &["dev", "web"]));
        let c = agg.aggregate(&tg("222", "m5.large", &["prod", "web"]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.value(TagKey::Account), Some("111"));
        assert_eq!(a.value(TagKey::UsageType), None);
        assert!(!a.is_grouped(TagKey::UsageType));
        assert_eq!(a.user_tag(0), None);
        assert_eq!(a.user_tag(1), Some("web"));
    }

    #[test]
    fn test_full_grouping_restores_tag_group() {
        let agg = Aggregation::new(&TagKey::ALL, &[0, 1]);
        let original = tg("111", "m5.large", &["prod", "web"]);
        assert_eq!(agg.aggregate(&original).tag_group(2), original);

        let regional = original.with_resource_group(None);
        let regional = TagGroup { zone: None, ..regional };
        let atg = agg.aggregate(&regional);
        assert!(atg.is_grouped(TagKey::Zone));
        assert!(!atg.is_resource());
        assert_eq!(atg.tag_group(2), regional);
    }

    #[test]
    fn test_project_onto_coarser_grouping() {
        let fine = Aggregation::new(&[TagKey::Account, TagKey::UsageType], &[0]);
        let coarse = Aggregation::new(&[TagKey::Account], &[]);
        let atg = fine.aggregate(&tg("111", "m5.large", &["prod", "web"]));
        assert_eq!(
            coarse.project(&atg),
            coarse.aggregate(&tg("111", "t3.micro", &["dev", "db"]))
        );
    }

    #[test]
    fn test_display_marks_wildcards() {
        let agg = Aggregation::new(&[TagKey::Account], &[]);
        let atg = agg.aggregate(&tg("111", "m5.large", &["prod"]));
        assert_eq!(atg.to_string(), "[111,*,*,*,*,*,*]");
    }
}
