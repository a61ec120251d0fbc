//! Result expressions
//!
//! `${in}`, `${in.cost}`, `${in.usage}`, `${name}`, `${name.cost}` and
//! `${name.usage}` placeholders are replaced by `ref_N` variables, bound per
//! hour from the in series and the operand series. A bare name means cost.

use crate::error::{PostProcError, Result};
use ice_calc::{CalcEngine, Formula};
use ice_model::CostAndUsage;
use std::collections::HashMap;
use std::ops::Range;

const IN: &str = "in";

/// `${name}` placeholders of a template: byte range of the whole placeholder
/// and the trimmed name inside it
pub(crate) fn placeholders(template: &str) -> Vec<(Range<usize>, &str)> {
    let mut found = Vec::new();
    let mut pos = 0;
    while let Some(offset) = template[pos..].find("${") {
        let start = pos + offset;
        let Some(len) = template[start + 2..].find('}') else {
            break;
        };
        let end = start + 2 + len + 1;
        found.push((start..end, template[start + 2..end - 1].trim()));
        pos = end;
    }
    found
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Cost,
    Usage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reference {
    placeholder: String,
    /// `None` for the in operand
    operand: Option<String>,
    field: Field,
}

impl Reference {
    fn variable(index: usize) -> String {
        format!("ref_{}", index)
    }
}

/// Parsed result expression
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    compiled_source: String,
    references: Vec<Reference>,
}

impl Expression {
    /// Parse `source`, checking every placeholder against the known operands
    pub fn parse<'a>(source: &str, operands: impl IntoIterator<Item = &'a str> + Clone) -> Result<Self> {
        let mut references: Vec<Reference> = Vec::new();
        let mut compiled_source = String::with_capacity(source.len());
        let mut last = 0;
        for (range, inner) in placeholders(source) {
            compiled_source.push_str(&source[last..range.start]);
            last = range.end;
            let placeholder = &source[range];
            if let Some(i) = references.iter().position(|r| r.placeholder == placeholder) {
                compiled_source.push_str(&Reference::variable(i));
                continue;
            }
            let (name, field) = match inner.split_once('.') {
                None => (inner, Field::Cost),
                Some((name, "cost")) => (name, Field::Cost),
                Some((name, "usage")) => (name, Field::Usage),
                Some((_, other)) => {
                    return Err(PostProcError::config(format!(
                        "Unknown field \"{}\" in expression \"{}\"",
                        other, source
                    )));
                },
            };
            let operand = if name == IN {
                None
            } else if operands.clone().into_iter().any(|o| o == name) {
                Some(name.to_string())
            } else {
                return Err(PostProcError::config(format!(
                    "Unknown operand \"{}\" in expression \"{}\"",
                    name, source
                )));
            };
            references.push(Reference {
                placeholder: placeholder.to_string(),
                operand,
                field,
            });
            compiled_source.push_str(&Reference::variable(references.len() - 1));
        }
        compiled_source.push_str(&source[last..]);
        Ok(Self {
            source: source.to_string(),
            compiled_source,
            references,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether the expression reads the in operand
    pub fn uses_in(&self) -> bool {
        self.references.iter().any(|r| r.operand.is_none())
    }

    /// Operand names referenced, without duplicates
    pub fn operands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .references
            .iter()
            .filter_map(|r| r.operand.as_deref())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn compile(&self) -> ice_calc::Result<Formula> {
        CalcEngine::new().compile(&self.compiled_source)
    }

    /// Placeholder values for one hour. Monthly series broadcast their only
    /// value; a missing value is 0.
    pub fn bindings(
        &self,
        in_value: CostAndUsage,
        operands: &HashMap<&str, &[CostAndUsage]>,
        hour: usize,
    ) -> Vec<f64> {
        self.references
            .iter()
            .map(|r| {
                let value = match &r.operand {
                    None => in_value,
                    Some(name) => operands
                        .get(name.as_str())
                        .and_then(|series| match series.len() {
                            1 => series.first(),
                            _ => series.get(hour),
                        })
                        .copied()
                        .unwrap_or(CostAndUsage::ZERO),
                };
                match r.field {
                    Field::Cost => value.cost,
                    Field::Usage => value.usage,
                }
            })
            .collect()
    }

    /// Evaluate with values from [`Expression::bindings`]
    pub fn evaluate(&self, formula: &mut Formula, values: &[f64]) -> ice_calc::Result<f64> {
        let names: Vec<String> = (0..values.len()).map(Reference::variable).collect();
        let variables: Vec<(&str, f64)> = names
            .iter()
            .map(String::as_str)
            .zip(values.iter().copied())
            .collect();
        formula.evaluate(&variables)
    }

    /// Source with every placeholder replaced by its value, for error reports
    pub fn expand(&self, values: &[f64]) -> String {
        let mut expanded = self.source.clone();
        for (r, v) in self.references.iter().zip(values) {
            expanded = expanded.replace(&r.placeholder, &v.to_string());
        }
        expanded
    }
}
