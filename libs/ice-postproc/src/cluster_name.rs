//! Cluster name formulae
//!
//! A formula derives a Kubernetes cluster name from a tag group's user tags:
//!
//! ```text
//! Tag1.toLower()+Tag2.regex("Stripme(-.*)")
//! "literal"
//! Cluster.regex("k8s-(.*)").toUpper()
//! ```
//!
//! Terms are user tag names or quoted literals, each followed by any number
//! of `.toUpper()`, `.toLower()` or `.regex("...")` calls, joined with `+`.
//! `regex` replaces a fully matching value with its first group (or the
//! whole match when the pattern has none) and leaves other values unchanged.

use crate::error::{PostProcError, Result};
use regex::Regex;

#[derive(Debug, Clone)]
enum Source {
    Literal(String),
    Tag { name: String, index: usize },
}

#[derive(Debug, Clone)]
enum Function {
    ToUpper,
    ToLower,
    Regex(Regex),
}

impl Function {
    fn apply(&self, value: String) -> String {
        match self {
            Function::ToUpper => value.to_uppercase(),
            Function::ToLower => value.to_lowercase(),
            Function::Regex(re) => match re.captures(&value) {
                Some(caps) => caps
                    .get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or(value),
                None => value,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Term {
    source: Source,
    functions: Vec<Function>,
}

impl Term {
    fn evaluate(&self, user_tags: &[String]) -> Option<String> {
        let value = match &self.source {
            Source::Literal(s) => s.clone(),
            Source::Tag { index, .. } => user_tags.get(*index).filter(|v| !v.is_empty())?.clone(),
        };
        Some(self.functions.iter().fold(value, |v, f| f.apply(v)))
    }
}

#[derive(Debug, Clone)]
struct Formula {
    terms: Vec<Term>,
}

impl Formula {
    fn evaluate(&self, user_tags: &[String]) -> Option<String> {
        self.terms
            .iter()
            .map(|t| t.evaluate(user_tags))
            .collect::<Option<Vec<_>>>()
            .map(|parts| parts.concat())
            .filter(|name| !name.is_empty())
    }
}

/// Recursive descent over one formula
struct Parser<'a> {
    text: &'a str,
    pos: usize,
    user_tag_keys: &'a [String],
}

impl<'a> Parser<'a> {
    fn error(&self, msg: &str) -> PostProcError {
        PostProcError::config(format!(
            "Bad cluster name formula \"{}\" at {}: {}",
            self.text, self.pos, msg
        ))
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.text.len() - trimmed.len();
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", token)))
        }
    }

    fn identifier(&mut self) -> Result<&'a str> {
        self.skip_whitespace();
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-' || c == ':'))
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.error("expected a tag name"));
        }
        self.pos += len;
        Ok(&rest[..len])
    }

    fn string_literal(&mut self) -> Result<String> {
        self.expect("\"")?;
        let rest = self.rest();
        let mut value = String::new();
        let mut chars = rest.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += i + 1;
                    return Ok(value);
                },
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        if escaped != '"' {
                            value.push('\\');
                        }
                        value.push(escaped);
                    }
                },
                c => value.push(c),
            }
        }
        Err(self.error("unterminated string"))
    }

    fn term(&mut self) -> Result<Term> {
        self.skip_whitespace();
        let source = if self.rest().starts_with('"') {
            Source::Literal(self.string_literal()?)
        } else {
            let name = self.identifier()?;
            let index = self
                .user_tag_keys
                .iter()
                .position(|k| k == name)
                .ok_or_else(|| self.error(&format!("unknown user tag \"{}\"", name)))?;
            Source::Tag {
                name: name.to_string(),
                index,
            }
        };

        let mut functions = Vec::new();
        while self.eat(".") {
            let function = match self.identifier()? {
                "toUpper" => {
                    self.expect("(")?;
                    Function::ToUpper
                },
                "toLower" => {
                    self.expect("(")?;
                    Function::ToLower
                },
                "regex" => {
                    self.expect("(")?;
                    let pattern = self.string_literal()?;
                    let re = Regex::new(&format!("^(?:{})$", pattern))
                        .map_err(|e| self.error(&e.to_string()))?;
                    Function::Regex(re)
                },
                other => return Err(self.error(&format!("unknown function \"{}\"", other))),
            };
            self.expect(")")?;
            functions.push(function);
        }
        Ok(Term { source, functions })
    }

    fn formula(mut self) -> Result<Formula> {
        let mut terms = vec![self.term()?];
        while self.eat("+") {
            terms.push(self.term()?);
        }
        self.skip_whitespace();
        if !self.rest().is_empty() {
            return Err(self.error("unexpected trailing text"));
        }
        Ok(Formula { terms })
    }
}

/// Candidate cluster names from user tags
#[derive(Debug, Clone)]
pub struct ClusterNameBuilder {
    formulae: Vec<Formula>,
}

impl ClusterNameBuilder {
    pub fn new(formulae: &[String], user_tag_keys: &[String]) -> Result<Self> {
        let formulae = formulae
            .iter()
            .map(|text| {
                Parser {
                    text,
                    pos: 0,
                    user_tag_keys,
                }
                .formula()
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { formulae })
    }

    /// User tags the formulae read
    pub fn referenced_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self
            .formulae
            .iter()
            .flat_map(|f| &f.terms)
            .filter_map(|t| match &t.source {
                Source::Tag { name, .. } => Some(name.as_str()),
                Source::Literal(_) => None,
            })
            .collect();
        tags.sort_unstable();
        tags.dedup();
        tags
    }

    /// Names produced by each formula, in formula order without duplicates
    pub fn cluster_names(&self, user_tags: &[String]) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.formulae.len());
        for name in self.formulae.iter().filter_map(|f| f.evaluate(user_tags)) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn tags() -> Vec<String> {
        vec!["Tag1".into(), "Tag2".into(), "Tag3".into()]
    }

    fn values(v: [&str; 3]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn first_name(formula: &str, user_tags: [&str; 3]) -> String {
        let cnb = ClusterNameBuilder::new(&[formula.to_string()], &tags()).unwrap();
        cnb.cluster_names(&values(user_tags)).remove(0)
    }

    #[test]
    fn test_no_functions() {
        assert_eq!(first_name("Tag3", ["One", "Two", "Three"]), "Three");
    }

    #[test]
    fn test_literal() {
        let cnb = ClusterNameBuilder::new(&["\"foobar\"".to_string()], &[]).unwrap();
        assert_eq!(cnb.cluster_names(&values(["One", "Two", "Three"])), vec!["foobar"]);
        assert!(cnb.referenced_tags().is_empty());
    }

    #[test]
    fn test_to_upper_and_lower() {
        assert_eq!(first_name("Tag2.toUpper()", ["One", "Two", "Three"]), "TWO");
        assert_eq!(first_name("Tag2.toLower()", ["One", "Two", "Three"]), "two");
    }

    #[test]
    fn test_regex() {
        assert_eq!(first_name("Tag2.regex(\"Stripme-(.*)\")", ["One", "Stripme-Two", "Three"]), "Two");
        assert_eq!(
            first_name("Tag2.regex(\"Stripme-(.*)\").toLower()", ["One", "Stripme-Two", "Three"]),
            "two"
        );
    }

    #[test]
    fn test_multiple_tag_rules() {
        assert_eq!(
            first_name("Tag1.toLower()+Tag2.regex(\"Stripme(-.*)\")", ["One", "Stripme-Two", "Three"]),
            "one-Two"
        );
    }

    #[test]
    fn test_empty_tags() {
        let cnb = ClusterNameBuilder::new(&["Tag2.toUpper()".to_string()], &tags()).unwrap();
        assert!(cnb.cluster_names(&values(["", "", ""])).is_empty());
        assert!(cnb.cluster_names(&[]).is_empty());
    }

    #[test]
    fn test_multiple_formulae() {
        let cnb = ClusterNameBuilder::new(
            &[
                "Tag1.toLower()+Tag2.regex(\"Stripme(-.*)\")".to_string(),
                "Tag3.regex(\"k8s-(.*)\")".to_string(),
            ],
            &tags(),
        )
        .unwrap();
        let names = cnb.cluster_names(&values(["One", "Stripme-Two", "k8s-Three"]));
        assert_eq!(names, vec!["one-Two".to_string(), "Three".to_string()]);
        assert_eq!(cnb.referenced_tags(), vec!["Tag1", "Tag2", "Tag3"]);
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["Tag4", "Tag1.trim()", "Tag1.regex(\"(\")", "Tag1 Tag2", "\"open"] {
            assert!(
                ClusterNameBuilder::new(&[bad.to_string()], &tags()).is_err(),
                "{} should not parse",
                bad
            );
        }
    }
}
