//! Account and product metadata lookups
//!
//! Both lookups are total: an unknown identifier materializes a new entry.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Accounts
// ============================================================================

/// Billing account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub name: String,
}

impl Account {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Resolves account identifiers to canonical accounts
pub trait AccountService: Send + Sync {
    fn get_account_by_id(&self, id: &str) -> Account;

    fn get_accounts(&self) -> Vec<Account>;
}

/// In-memory account registry
#[derive(Default)]
pub struct BasicAccountService {
    accounts: RwLock<BTreeMap<String, Account>>,
}

impl BasicAccountService {
    pub fn new(accounts: impl IntoIterator<Item = Account>) -> Self {
        Self {
            accounts: RwLock::new(accounts.into_iter().map(|a| (a.id.clone(), a)).collect()),
        }
    }
}

impl AccountService for BasicAccountService {
    fn get_account_by_id(&self, id: &str) -> Account {
        if let Some(account) = self.accounts.read().get(id) {
            return account.clone();
        }
        self.accounts
            .write()
            .entry(id.to_string())
            .or_insert_with(|| Account::new(id, id))
            .clone()
    }

    fn get_accounts(&self) -> Vec<Account> {
        self.accounts.read().values().cloned().collect()
    }
}

// ============================================================================
// Products
// ============================================================================

/// Service codes with special handling in cluster allocation
pub mod service_code {
    pub const EC2_INSTANCE: &str = "EC2Instance";
    pub const CLOUD_WATCH: &str = "AmazonCloudWatch";
    pub const EBS: &str = "EBS";
    pub const DATA_TRANSFER: &str = "DataTransfer";
}

/// Billing product
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Product {
    pub service_code: String,
    pub name: String,
}

impl Product {
    pub fn new(service_code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            service_code: service_code.into(),
            name: name.into(),
        }
    }

    pub fn is_ec2_instance(&self) -> bool {
        self.service_code == service_code::EC2_INSTANCE
    }

    pub fn is_cloud_watch(&self) -> bool {
        self.service_code == service_code::CLOUD_WATCH
    }

    pub fn is_ebs(&self) -> bool {
        self.service_code == service_code::EBS
    }

    pub fn is_data_transfer(&self) -> bool {
        self.service_code == service_code::DATA_TRANSFER
    }
}

/// Resolves product service codes to canonical products
pub trait ProductService: Send + Sync {
    fn get_product_by_service_code(&self, service_code: &str) -> Product;

    fn get_products(&self) -> Vec<Product>;
}

/// In-memory product registry
#[derive(Default)]
pub struct BasicProductService {
    products: RwLock<BTreeMap<String, Product>>,
}

impl BasicProductService {
    pub fn new(products: impl IntoIterator<Item = Product>) -> Self {
        Self {
            products: RwLock::new(
                products
                    .into_iter()
                    .map(|p| (p.service_code.clone(), p))
                    .collect(),
            ),
        }
    }
}

impl ProductService for BasicProductService {
    fn get_product_by_service_code(&self, service_code: &str) -> Product {
        if let Some(product) = self.products.read().get(service_code) {
            return product.clone();
        }
        self.products
            .write()
            .entry(service_code.to_string())
            .or_insert_with(|| Product::new(service_code, service_code))
            .clone()
    }

    fn get_products(&self) -> Vec<Product> {
        self.products.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_product_is_materialized() {
        let ps = BasicProductService::default();
        assert!(ps.get_products().is_empty());
        let p = ps.get_product_by_service_code("ComputedCost");
        assert_eq!(p.name, "ComputedCost");
        assert_eq!(ps.get_products().len(), 1);
    }

    #[test]
    fn test_known_account_keeps_name() {
        let accounts = BasicAccountService::new([Account::new("123456789012", "prod")]);
        assert_eq!(accounts.get_account_by_id("123456789012").name, "prod");
        assert_eq!(accounts.get_account_by_id("999").name, "999");
        assert_eq!(accounts.get_accounts().len(), 2);
    }

    #[test]
    fn test_product_classification() {
        assert!(Product::new(service_code::EBS, "Elastic Block Store").is_ebs());
        assert!(!Product::new("AmazonS3", "S3").is_ec2_instance());
    }
}
