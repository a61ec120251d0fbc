//! CalcEngine - Expression evaluator with built-in functions
//!
//! Provides formula evaluation with support for:
//! - Arithmetic: +, -, *, /, ^, %
//! - Comparison: <, >, <=, >=, ==, !=
//! - Logic: &&, ||, !
//! - Built-in functions: scale, clamp, abs, min, max, round, sign
//!
//! All numeric literals are treated as floating point, so `1 / 4` is `0.25`
//! rather than integer division.

use crate::builtin_functions;
use crate::error::{CalcError, Result};
use evalexpr::{ContextWithMutableFunctions, ContextWithMutableVariables, Node, Value};
use std::collections::HashMap;

/// CalcEngine - Formula evaluation engine
///
/// # Example
/// ```
/// use ice_calc::CalcEngine;
/// use std::collections::HashMap;
///
/// let engine = CalcEngine::new();
/// let mut vars = HashMap::new();
/// vars.insert("usage".to_string(), 2000.0);
///
/// let cost = engine.evaluate_simple("usage * 0.01 / 1000", &vars).unwrap();
/// assert!((cost - 0.02).abs() < 1e-12);
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct CalcEngine;

impl CalcEngine {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate an expression once
    pub fn evaluate_simple(&self, formula: &str, variables: &HashMap<String, f64>) -> Result<f64> {
        let mut compiled = self.compile(formula)?;
        let vars: Vec<(&str, f64)> = variables.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        compiled.evaluate(&vars)
    }

    /// Parse a formula once for repeated evaluation with different variable values
    pub fn compile(&self, formula: &str) -> Result<Formula> {
        let normalized = float_literals(formula);
        let tree = evalexpr::build_operator_tree(&normalized).map_err(|e| {
            CalcError::expression(format!("Failed to parse '{}': {}", formula, e))
        })?;

        let mut context = evalexpr::HashMapContext::new();
        Self::register_stateless_functions(&mut context)?;

        Ok(Formula {
            source: formula.to_string(),
            tree,
            context,
        })
    }

    /// Register stateless functions with evalexpr context
    fn register_stateless_functions(context: &mut evalexpr::HashMapContext) -> Result<()> {
        use evalexpr::{EvalexprError, Function};

        // Helper to convert Value to f64 (handles both Int and Float)
        fn to_f64(value: &Value) -> std::result::Result<f64, EvalexprError> {
            match value {
                Value::Float(f) => Ok(*f),
                Value::Int(i) => Ok(*i as f64),
                _ => Err(EvalexprError::expected_number(value.clone())),
            }
        }

        // Fixed-arity argument list
        fn args_n(args: &Value, n: usize) -> std::result::Result<Vec<f64>, EvalexprError> {
            let tuple = args.as_tuple()?;
            if tuple.len() != n {
                return Err(EvalexprError::CustomMessage(format!(
                    "expected {} arguments, got {}",
                    n,
                    tuple.len()
                )));
            }
            tuple.iter().map(to_f64).collect()
        }

        let register = |context: &mut evalexpr::HashMapContext, name: &str, f: Function| {
            context
                .set_function(name.to_string(), f)
                .map_err(|e| CalcError::function(format!("Failed to register {}: {}", name, e)))
        };

        // scale(value, factor)
        register(
            context,
            "scale",
            Function::new(|args| {
                let a = args_n(args, 2)?;
                Ok(Value::Float(builtin_functions::scale(a[0], a[1])))
            }),
        )?;

        // clamp(value, min, max)
        register(
            context,
            "clamp",
            Function::new(|args| {
                let a = args_n(args, 3)?;
                Ok(Value::Float(builtin_functions::clamp(a[0], a[1], a[2])))
            }),
        )?;

        // abs(value)
        register(
            context,
            "abs",
            Function::new(|args| Ok(Value::Float(builtin_functions::abs(to_f64(args)?)))),
        )?;

        // min(a, b)
        register(
            context,
            "min",
            Function::new(|args| {
                let a = args_n(args, 2)?;
                Ok(Value::Float(builtin_functions::min(a[0], a[1])))
            }),
        )?;

        // max(a, b)
        register(
            context,
            "max",
            Function::new(|args| {
                let a = args_n(args, 2)?;
                Ok(Value::Float(builtin_functions::max(a[0], a[1])))
            }),
        )?;

        // round(value, decimals)
        register(
            context,
            "round",
            Function::new(|args| {
                let a = args_n(args, 2)?;
                Ok(Value::Float(builtin_functions::round(a[0], a[1] as i32)))
            }),
        )?;

        // sign(value)
        register(
            context,
            "sign",
            Function::new(|args| Ok(Value::Float(builtin_functions::sign(to_f64(args)?)))),
        )?;

        Ok(())
    }
}

/// A parsed formula with its own evaluation context
pub struct Formula {
    source: String,
    tree: Node,
    context: evalexpr::HashMapContext,
}

impl Formula {
    /// Formula text as written
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate with the given variable bindings
    ///
    /// Variables not referenced by the formula are ignored. A result that is
    /// not a finite number (e.g. division by zero) is an error.
    pub fn evaluate(&mut self, variables: &[(&str, f64)]) -> Result<f64> {
        for (name, value) in variables {
            self.context
                .set_value(name.to_string(), Value::Float(*value))
                .map_err(|e| {
                    CalcError::expression(format!("Failed to set variable {}: {}", name, e))
                })?;
        }

        let result = self
            .tree
            .eval_with_context(&self.context)
            .map_err(|e| match e {
                evalexpr::EvalexprError::VariableIdentifierNotFound(name) => {
                    CalcError::variable_not_found(name)
                },
                e => CalcError::expression(format!("Failed to evaluate '{}': {}", self.source, e)),
            })?;

        let value = value_to_f64(result, &self.source)?;
        if !value.is_finite() {
            return Err(CalcError::NonFinite(format!(
                "'{}' evaluated to {}",
                self.source, value
            )));
        }
        Ok(value)
    }
}

/// Convert evalexpr Value to f64
fn value_to_f64(value: Value, formula: &str) -> Result<f64> {
    match value {
        Value::Float(f) => Ok(f),
        Value::Int(i) => Ok(i as f64),
        Value::Boolean(b) => Ok(if b { 1.0 } else { 0.0 }),
        _ => Err(CalcError::expression(format!(
            "Expression did not evaluate to a number: {}",
            formula
        ))),
    }
}

/// Rewrite bare integer literals as float literals (`4` -> `4.0`)
///
/// Digits that are part of an identifier, a decimal number or an exponent are
/// left alone. Text inside string literals is copied unchanged.
fn float_literals(formula: &str) -> String {
    let chars: Vec<char> = formula.chars().collect();
    let mut out = String::with_capacity(formula.len() + 8);
    let mut i = 0;
    let mut in_string = false;

    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            in_string = !in_string;
            out.push(c);
            i += 1;
            continue;
        }
        let starts_token = i == 0 || !is_ident_char(chars[i - 1]);
        if in_string || !c.is_ascii_digit() || !starts_token {
            out.push(c);
            i += 1;
            continue;
        }

        let start = i;
        i = skip_digits(&chars, i);
        let mut is_float = false;
        if i < chars.len() && chars[i] == '.' {
            i = skip_digits(&chars, i + 1);
            is_float = true;
        }
        if let Some(end) = exponent_end(&chars, i) {
            i = end;
            is_float = true;
        }
        out.extend(&chars[start..i]);
        let continues = i < chars.len() && is_ident_char(chars[i]);
        if !is_float && !continues {
            out.push_str(".0");
        }
    }
    out
}

fn skip_digits(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    i
}

/// End of an `e3`, `E+2` or `e-3` exponent starting at `i`
fn exponent_end(chars: &[char], i: usize) -> Option<usize> {
    if !matches!(chars.get(i), Some('e') | Some('E')) {
        return None;
    }
    let mut j = i + 1;
    if matches!(chars.get(j), Some('+') | Some('-')) {
        j += 1;
    }
    let end = skip_digits(chars, j);
    (end > j).then_some(end)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '.'
}
