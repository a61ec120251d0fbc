//! Tag keys, resource groups and tag groups
//!
//! A [`TagGroup`] is the composite key of the tagged time series: one value for
//! each fixed billing dimension plus an optional [`ResourceGroup`] holding the
//! user defined tag values in user tag key order.

use crate::error::ModelError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

// ============================================================================
// Tag Keys
// ============================================================================

/// Fixed billing dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TagKey {
    Account,
    Region,
    Zone,
    Product,
    Operation,
    UsageType,
}

impl TagKey {
    /// All fixed dimensions in canonical order
    pub const ALL: [TagKey; 6] = [
        TagKey::Account,
        TagKey::Region,
        TagKey::Zone,
        TagKey::Product,
        TagKey::Operation,
        TagKey::UsageType,
    ];

    /// Configuration name of the dimension
    pub fn name(&self) -> &'static str {
        match self {
            TagKey::Account => "account",
            TagKey::Region => "region",
            TagKey::Zone => "zone",
            TagKey::Product => "product",
            TagKey::Operation => "operation",
            TagKey::UsageType => "usageType",
        }
    }

    /// Column header used in reports
    pub fn column_name(&self) -> &'static str {
        match self {
            TagKey::Account => "Account",
            TagKey::Region => "Region",
            TagKey::Zone => "Zone",
            TagKey::Product => "Product",
            TagKey::Operation => "Operation",
            TagKey::UsageType => "UsageType",
        }
    }

    /// Position in [`TagKey::ALL`]
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Look up a dimension by its configuration name
    pub fn from_name(name: &str) -> Option<TagKey> {
        name_table().get(name).copied()
    }
}

/// Process-wide name table, built once
fn name_table() -> &'static HashMap<&'static str, TagKey> {
    static TABLE: OnceLock<HashMap<&'static str, TagKey>> = OnceLock::new();
    TABLE.get_or_init(|| TagKey::ALL.iter().map(|k| (k.name(), *k)).collect())
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TagKey {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TagKey::from_name(s).ok_or_else(|| ModelError::UnknownTagKey(s.to_string()))
    }
}

// ============================================================================
// Resource Group
// ============================================================================

/// Ordered user tag values of a tag group. An empty string means the tag is unset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ResourceGroup(Vec<String>);

impl ResourceGroup {
    pub fn new(values: Vec<String>) -> Self {
        Self(values)
    }

    /// Resource group with `len` unset user tags
    pub fn empty(len: usize) -> Self {
        Self(vec![String::new(); len])
    }

    pub fn values(&self) -> &[String] {
        &self.0
    }

    /// Value of the user tag at `index`, "" if unset or out of range
    pub fn get(&self, index: usize) -> &str {
        self.0.get(index).map(String::as_str).unwrap_or("")
    }

    /// Return a copy with the user tag at `index` replaced
    pub fn with_value(&self, index: usize, value: impl Into<String>) -> Self {
        let mut values = self.0.clone();
        if values.len() <= index {
            values.resize(index + 1, String::new());
        }
        values[index] = value.into();
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ResourceGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("|"))
    }
}

// ============================================================================
// Tag Group
// ============================================================================

/// Composite key into the tagged time series
///
/// Equality, hashing and ordering are structural over every field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagGroup {
    /// Account identifier
    pub account: String,
    /// Region name
    pub region: String,
    /// Availability zone, absent for regional line items
    pub zone: Option<String>,
    /// Product service code
    pub product: String,
    pub operation: String,
    pub usage_type: String,
    /// User tag values, absent for non-resource data
    pub resource_group: Option<ResourceGroup>,
}

impl TagGroup {
    pub fn new(
        account: impl Into<String>,
        region: impl Into<String>,
        zone: Option<String>,
        product: impl Into<String>,
        operation: impl Into<String>,
        usage_type: impl Into<String>,
        resource_group: Option<ResourceGroup>,
    ) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
            zone,
            product: product.into(),
            operation: operation.into(),
            usage_type: usage_type.into(),
            resource_group,
        }
    }

    /// Value of a fixed dimension. Returns `None` only for an absent zone.
    pub fn value(&self, key: TagKey) -> Option<&str> {
        match key {
            TagKey::Account => Some(&self.account),
            TagKey::Region => Some(&self.region),
            TagKey::Zone => self.zone.as_deref(),
            TagKey::Product => Some(&self.product),
            TagKey::Operation => Some(&self.operation),
            TagKey::UsageType => Some(&self.usage_type),
        }
    }

    /// Value of the user tag at `index`, "" for non-resource tag groups
    pub fn user_tag(&self, index: usize) -> &str {
        self.resource_group
            .as_ref()
            .map(|rg| rg.get(index))
            .unwrap_or("")
    }

    pub fn with_resource_group(&self, resource_group: Option<ResourceGroup>) -> Self {
        Self {
            resource_group,
            ..self.clone()
        }
    }

    pub fn is_resource(&self) -> bool {
        self.resource_group.is_some()
    }
}

impl fmt::Display for TagGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"{}\",\"{}\",\"{}\",\"{}\",\"{}\",\"{}\"",
            self.account,
            self.region,
            self.zone.as_deref().unwrap_or(""),
            self.product,
            self.operation,
            self.usage_type
        )?;
        if let Some(rg) = &self.resource_group {
            write!(f, ",\"{}\"", rg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tag_key_names() {
        for key in TagKey::ALL {
            assert_eq!(TagKey::from_name(key.name()), Some(key));
        }
        assert_eq!(TagKey::from_name("usageType"), Some(TagKey::UsageType));
        assert_eq!(TagKey::from_name("UsageType"), None);
        assert!("costCenter".parse::<TagKey>().is_err());
    }

    #[test]
    fn test_tag_key_index_matches_all() {
        for (i, key) in TagKey::ALL.iter().enumerate() {
            assert_eq!(key.index(), i);
        }
    }

    #[test]
    fn test_tag_group_structural_equality() {
        let rg = ResourceGroup::new(vec!["web".into(), "prod".into()]);
        let a = TagGroup::new("123", "us-east-1", None, "EC2", "RunInstances", "m5.large", Some(rg.clone()));
        let b = TagGroup::new("123", "us-east-1", None, "EC2", "RunInstances", "m5.large", Some(rg));
        let c = a.with_resource_group(None);

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
        assert!(!c.is_resource());
    }

    #[test]
    fn test_resource_group_with_value_extends() {
        let rg = ResourceGroup::empty(1).with_value(2, "x");
        assert_eq!(rg.values(), &["".to_string(), "".to_string(), "x".to_string()]);
        assert_eq!(rg.get(5), "");
    }

    #[test]
    fn test_value_for_absent_zone() {
        let tg = TagGroup::new("1", "eu-west-1", None, "S3", "Get", "Requests", None);
        assert_eq!(tg.value(TagKey::Zone), None);
        assert_eq!(tg.value(TagKey::Region), Some("eu-west-1"));
        assert_eq!(tg.user_tag(0), "");
    }
}
