//! ice-calc - Expression evaluation for post-processing rules
//!
//! Rule results are arithmetic formulas over the values of the rule's
//! operands. This crate parses and evaluates them.
//!
//! # Example
//!
//! ```rust
//! use ice_calc::CalcEngine;
//! use std::collections::HashMap;
//!
//! let engine = CalcEngine::new();
//! let mut vars = HashMap::new();
//! vars.insert("cost".to_string(), 1000.0);
//! vars.insert("rate".to_string(), 0.95);
//!
//! let result = engine.evaluate_simple("cost * rate", &vars).unwrap();
//! assert_eq!(result, 950.0);
//!
//! let clamped = engine.evaluate_simple("clamp(cost, 0, 500)", &vars).unwrap();
//! assert_eq!(clamped, 500.0);
//! ```
//!
//! # Built-in Functions
//!
//! | Function | Signature | Description |
//! |----------|-----------|-------------|
//! | `scale` | `scale(value, factor)` | Multiply by factor |
//! | `clamp` | `clamp(value, min, max)` | Limit to range |
//! | `abs` | `abs(value)` | Absolute value |
//! | `min` | `min(a, b)` | Minimum of two |
//! | `max` | `max(a, b)` | Maximum of two |
//! | `round` | `round(value, decimals)` | Round to decimals |
//! | `sign` | `sign(value)` | Sign: -1, 0, or 1 |

pub mod builtin_functions;
pub mod error;
pub mod evaluator;

// Re-exports for convenience
pub use error::{CalcError, Result};
pub use evaluator::{CalcEngine, Formula};

// Re-export stateless functions for direct use
pub use builtin_functions::{abs, clamp, max, min, round, scale, sign};
