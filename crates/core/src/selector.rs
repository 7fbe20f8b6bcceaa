//! Label and field selectors: parsing, local matching, and the combination
//! rules used when two cache views are merged.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelOp {
    Eq,
    NotEq,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// One label requirement, e.g. `app=web` or `tier in (db,cache)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRequirement {
    pub key: String,
    pub op: LabelOp,
    pub values: Vec<String>,
}

impl LabelRequirement {
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), op: LabelOp::Eq, values: vec![value.into()] }
    }

    pub fn not_equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), op: LabelOp::NotEq, values: vec![value.into()] }
    }

    pub fn in_set(key: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { key: key.into(), op: LabelOp::In, values: values.into_iter().map(Into::into).collect() }
    }

    pub fn not_in_set(key: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { key: key.into(), op: LabelOp::NotIn, values: values.into_iter().map(Into::into).collect() }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self { key: key.into(), op: LabelOp::Exists, values: Vec::new() }
    }

    pub fn does_not_exist(key: impl Into<String>) -> Self {
        Self { key: key.into(), op: LabelOp::DoesNotExist, values: Vec::new() }
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let held = labels.get(&self.key);
        match self.op {
            LabelOp::Eq | LabelOp::In => match held {
                Some(v) => self.values.iter().any(|w| w == v),
                None => false,
            },
            // Absent keys satisfy negated requirements, like the server.
            LabelOp::NotEq | LabelOp::NotIn => match held {
                Some(v) => !self.values.iter().any(|w| w == v),
                None => true,
            },
            LabelOp::Exists => held.is_some(),
            LabelOp::DoesNotExist => held.is_none(),
        }
    }
}

impl fmt::Display for LabelRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            LabelOp::Eq => write!(f, "{}={}", self.key, self.values.first().map(String::as_str).unwrap_or_default()),
            LabelOp::NotEq => write!(f, "{}!={}", self.key, self.values.first().map(String::as_str).unwrap_or_default()),
            LabelOp::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            LabelOp::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
            LabelOp::Exists => write!(f, "{}", self.key),
            LabelOp::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A set of label requirements; an object matches when every requirement
/// holds. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    requirements: Vec<LabelRequirement>,
}

impl LabelSelector {
    pub fn new(requirements: impl IntoIterator<Item = LabelRequirement>) -> Self {
        Self { requirements: requirements.into_iter().collect() }
    }

    pub fn requirements(&self) -> &[LabelRequirement] {
        &self.requirements
    }

    pub fn add(&mut self, req: LabelRequirement) {
        self.requirements.push(req);
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Parse kubectl selector syntax, e.g.
    /// `app=web,tier!=cache,env in (prod,staging),!legacy`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut requirements = Vec::new();
        for chunk in split_top_level(s) {
            let chunk = chunk.trim();
            if chunk.is_empty() {
                continue;
            }
            requirements.push(parse_label_requirement(chunk)?);
        }
        Ok(Self { requirements })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", rendered.join(","))
    }
}

/// Split on commas that are not inside a `( )` value set.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn parse_label_requirement(chunk: &str) -> Result<LabelRequirement> {
    if let Some(key) = chunk.strip_prefix('!') {
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid label requirement: {:?}", chunk);
        }
        return Ok(LabelRequirement::does_not_exist(key));
    }
    if let Some((key, rest)) = split_set_op(chunk, " notin ") {
        return Ok(LabelRequirement::not_in_set(key, parse_value_set(rest, chunk)?));
    }
    if let Some((key, rest)) = split_set_op(chunk, " in ") {
        return Ok(LabelRequirement::in_set(key, parse_value_set(rest, chunk)?));
    }
    if let Some((key, value)) = chunk.split_once("!=") {
        return Ok(LabelRequirement::not_equal(key.trim(), value.trim()));
    }
    if let Some((key, value)) = chunk.split_once("==") {
        return Ok(LabelRequirement::equal(key.trim(), value.trim()));
    }
    if let Some((key, value)) = chunk.split_once('=') {
        return Ok(LabelRequirement::equal(key.trim(), value.trim()));
    }
    Ok(LabelRequirement::exists(chunk))
}

fn split_set_op<'a>(chunk: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, rest) = chunk.split_once(op)?;
    Some((key.trim(), rest.trim()))
}

fn parse_value_set(rest: &str, chunk: &str) -> Result<Vec<String>> {
    let inner = rest
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| anyhow!("invalid label requirement: {:?} (expect key in (a,b))", chunk))?;
    Ok(inner.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldOp {
    Eq,
    NotEq,
}

/// One field term over a dotted path, e.g. `status.phase=Running`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTerm {
    pub path: String,
    pub op: FieldOp,
    pub value: String,
}

/// Conjunction of field terms. Matching is evaluated locally against the raw
/// object; a missing field reads as the empty string, like the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSelector {
    terms: Vec<FieldTerm>,
}

impl FieldSelector {
    pub fn equal(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self { terms: vec![FieldTerm { path: path.into(), op: FieldOp::Eq, value: value.into() }] }
    }

    pub fn not_equal(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self { terms: vec![FieldTerm { path: path.into(), op: FieldOp::NotEq, value: value.into() }] }
    }

    pub fn terms(&self) -> &[FieldTerm] {
        &self.terms
    }

    /// Logical AND of the operands' terms.
    pub fn and(selectors: impl IntoIterator<Item = FieldSelector>) -> Self {
        let mut terms = Vec::new();
        for s in selectors {
            terms.extend(s.terms);
        }
        Self { terms }
    }

    /// Parse `metadata.name=foo,status.phase!=Running`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut terms = Vec::new();
        for chunk in s.split(',') {
            let chunk = chunk.trim();
            if chunk.is_empty() {
                continue;
            }
            let term = if let Some((path, value)) = chunk.split_once("!=") {
                FieldTerm { path: path.trim().to_string(), op: FieldOp::NotEq, value: value.trim().to_string() }
            } else if let Some((path, value)) = chunk.split_once("==") {
                FieldTerm { path: path.trim().to_string(), op: FieldOp::Eq, value: value.trim().to_string() }
            } else if let Some((path, value)) = chunk.split_once('=') {
                FieldTerm { path: path.trim().to_string(), op: FieldOp::Eq, value: value.trim().to_string() }
            } else {
                bail!("invalid field selector term: {:?}", chunk);
            };
            terms.push(term);
        }
        Ok(Self { terms })
    }

    pub fn matches(&self, raw: &serde_json::Value) -> bool {
        self.terms.iter().all(|t| {
            let held = field_at(raw, &t.path).unwrap_or_default();
            match t.op {
                FieldOp::Eq => held == t.value,
                FieldOp::NotEq => held != t.value,
            }
        })
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .terms
            .iter()
            .map(|t| match t.op {
                FieldOp::Eq => format!("{}={}", t.path, t.value),
                FieldOp::NotEq => format!("{}!={}", t.path, t.value),
            })
            .collect();
        write!(f, "{}", rendered.join(","))
    }
}

/// Scalar at a dotted path, rendered as a string.
fn field_at(raw: &serde_json::Value, path: &str) -> Option<String> {
    let mut cur = raw;
    for seg in path.split('.') {
        cur = cur.get(seg)?;
    }
    match cur {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The restriction a view applies on one axis pair: optional label side,
/// optional field side. `None` on a side means no restriction there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub labels: Option<LabelSelector>,
    pub fields: Option<FieldSelector>,
}

impl Selector {
    pub fn labels(labels: LabelSelector) -> Self {
        Self { labels: Some(labels), fields: None }
    }

    pub fn fields(fields: FieldSelector) -> Self {
        Self { labels: None, fields: Some(fields) }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.labels.is_none() && self.fields.is_none()
    }

    /// Merge selectors from stacked views.
    ///
    /// Label sides are unioned at the requirement level: the result exists as
    /// soon as one input has a label side, and carries every requirement from
    /// every input. Field sides are ANDed; absent ones are dropped, and a
    /// single survivor is returned unchanged.
    pub fn combine<'a>(selectors: impl IntoIterator<Item = &'a Selector>) -> Selector {
        let mut label_side: Option<LabelSelector> = None;
        let mut field_sides: Vec<FieldSelector> = Vec::new();
        for s in selectors {
            if let Some(ls) = &s.labels {
                let combined = label_side.get_or_insert_with(LabelSelector::default);
                for req in ls.requirements() {
                    combined.add(req.clone());
                }
            }
            if let Some(fs) = &s.fields {
                field_sides.push(fs.clone());
            }
        }
        let fields = match field_sides.len() {
            0 => None,
            1 => Some(field_sides.remove(0)),
            _ => Some(FieldSelector::and(field_sides)),
        };
        Selector { labels: label_side, fields }
    }

    /// Evaluate both sides against a raw object.
    pub fn matches_object(&self, raw: &serde_json::Value) -> bool {
        if let Some(ls) = &self.labels {
            if !ls.matches(&crate::labels_of(raw)) {
                return false;
            }
        }
        if let Some(fs) = &self.fields {
            if !fs.matches(raw) {
                return false;
            }
        }
        true
    }
}
