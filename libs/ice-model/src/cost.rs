//! Cost and usage value pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};

/// Numeric pair stored per hour and tag group
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostAndUsage {
    pub cost: f64,
    pub usage: f64,
}

impl CostAndUsage {
    pub const ZERO: CostAndUsage = CostAndUsage {
        cost: 0.0,
        usage: 0.0,
    };

    pub fn new(cost: f64, usage: f64) -> Self {
        Self { cost, usage }
    }

    pub fn is_zero(&self) -> bool {
        self.cost == 0.0 && self.usage == 0.0
    }

    /// Scale both values by `factor`
    pub fn mul(&self, factor: f64) -> Self {
        Self {
            cost: self.cost * factor,
            usage: self.usage * factor,
        }
    }

    pub fn sub(&self, other: &CostAndUsage) -> Self {
        Self {
            cost: self.cost - other.cost,
            usage: self.usage - other.usage,
        }
    }
}

impl Add for CostAndUsage {
    type Output = CostAndUsage;

    fn add(self, rhs: CostAndUsage) -> CostAndUsage {
        CostAndUsage {
            cost: self.cost + rhs.cost,
            usage: self.usage + rhs.usage,
        }
    }
}

impl AddAssign for CostAndUsage {
    fn add_assign(&mut self, rhs: CostAndUsage) {
        self.cost += rhs.cost;
        self.usage += rhs.usage;
    }
}

impl fmt::Display for CostAndUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{cost: {}, usage: {}}}", self.cost, self.usage)
    }
}
