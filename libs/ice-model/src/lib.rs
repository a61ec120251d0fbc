//! ice-model - Data model for cost and usage post-processing
//!
//! Provides the types shared by the post-processor and its callers:
//!
//! - `tags`: fixed tag keys, resource groups and tag groups
//! - `cost`: the cost/usage value pair
//! - `store`: the hourly tagged time-series store trait and an in-memory implementation
//! - `data`: the per-product data set for one month, with CSV import/export
//! - `metadata`: account and product lookups
//! - `time`: month and timestamp helpers

pub mod cost;
pub mod data;
pub mod error;
pub mod metadata;
pub mod store;
pub mod tags;
pub mod time;

// Re-exports for convenience
pub use cost::CostAndUsage;
pub use data::{CostAndUsageData, ProductKey};
pub use error::{ModelError, Result};
pub use metadata::{
    Account, AccountService, BasicAccountService, BasicProductService, Product, ProductService,
};
pub use store::{MemoryStore, TagGroupStore};
pub use tags::{ResourceGroup, TagGroup, TagKey};
