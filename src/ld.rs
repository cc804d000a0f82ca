//! Typed view of linked-data API documents.
//!
//! A document maps subject URLs to properties, and each property to one or
//! more terms of the form `{"type": "uri" | "literal" | "bnode", "value": ...}`.
//! Malformed parts of a document are skipped rather than rejected.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::Value;
use url::Url;

/// Prefix of RDF container membership properties (`rdf:_1`, `rdf:_2`, ...).
pub const RDF_MEMBER_PREFIX: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#_";

/// Property URIs used by reading list objects.
pub mod props {
  pub const AIISO_CODE: &str = "http://purl.org/vocab/aiiso/schema#code";
  pub const AIISO_NAME: &str = "http://purl.org/vocab/aiiso/schema#name";
  pub const CREATED: &str = "http://purl.org/vocab/resourcelist/schema#created";
  pub const DESCRIPTION: &str = "http://purl.org/vocab/resourcelist/schema#description";
  pub const HAS_CREATOR: &str = "http://rdfs.org/sioc/spec/has_creator";
  pub const HAS_OWNER: &str = "http://purl.org/vocab/resourcelist/schema#hasOwner";
  pub const LAST_PUBLISHED: &str = "http://purl.org/vocab/resourcelist/schema#lastPublished";
  pub const LAST_UPDATED: &str = "http://purl.org/vocab/resourcelist/schema#lastUpdated";
  pub const NAME: &str = "http://rdfs.org/sioc/spec/name";
  pub const PUBLISHED_BY: &str = "http://purl.org/vocab/resourcelist/schema#publishedBy";
  pub const USED_BY: &str = "http://purl.org/vocab/resourcelist/schema#usedBy";
  pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TermKind {
  Uri,
  Literal,
  BNode,
  Other(String),
}

impl TermKind {
  fn parse(kind: &str) -> Self {
    match kind {
      "uri" => Self::Uri,
      "literal" => Self::Literal,
      "bnode" => Self::BNode,
      other => Self::Other(other.to_string()),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Term {
  pub kind: TermKind,
  pub value: String,
  pub datatype: Option<String>,
  pub lang: Option<String>,
}

impl Term {
  /// Build a term from `{"type": ..., "value": ...}`. Non-string values are
  /// kept in their JSON text form.
  fn from_value(value: &Value) -> Option<Self> {
    let obj = value.as_object()?;
    let text = match obj.get("value")? {
      Value::String(s) => s.clone(),
      Value::Null => return None,
      other => other.to_string(),
    };
    let string = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
    Some(Self {
      kind: TermKind::parse(obj.get("type").and_then(Value::as_str).unwrap_or_default()),
      value: text,
      datatype: string("datatype"),
      lang: string("lang"),
    })
  }

  pub fn is_uri(&self) -> bool {
    self.kind == TermKind::Uri
  }
}

/// One subject of a document and its properties.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subject {
  pub url: String,
  properties: BTreeMap<String, Vec<Term>>,
}

impl Subject {
  fn from_value(url: &str, value: &Value) -> Self {
    let mut properties = BTreeMap::new();
    if let Some(obj) = value.as_object() {
      for (property, terms) in obj {
        let terms: Vec<Term> = match terms {
          Value::Array(items) => items.iter().filter_map(Term::from_value).collect(),
          single => Term::from_value(single).into_iter().collect(),
        };
        if !terms.is_empty() {
          properties.insert(property.clone(), terms);
        }
      }
    }
    Self {
      url: url.to_string(),
      properties,
    }
  }

  pub fn properties(&self) -> impl Iterator<Item = (&str, &[Term])> {
    self
      .properties
      .iter()
      .map(|(name, terms)| (name.as_str(), terms.as_slice()))
  }

  pub fn values(&self, property: &str) -> &[Term] {
    self
      .properties
      .get(property)
      .map(Vec::as_slice)
      .unwrap_or_default()
  }

  /// First value of a property.
  pub fn scalar(&self, property: &str) -> Option<&str> {
    self.values(property).first().map(|t| t.value.as_str())
  }

  /// First value of a property as a timestamp. Plain dates are taken as
  /// midnight UTC.
  pub fn date(&self, property: &str) -> Option<DateTime<FixedOffset>> {
    let value = self.scalar(property)?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
      return Some(dt);
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().fixed_offset())
  }

  pub fn boolean(&self, property: &str) -> Option<bool> {
    match self.scalar(property)?.trim().to_ascii_lowercase().as_str() {
      "true" | "1" => Some(true),
      "false" | "0" => Some(false),
      _ => None,
    }
  }

  /// Members of an RDF sequence, ordered by index.
  pub fn sequence(&self) -> Vec<&Term> {
    let mut members: Vec<(u64, &Term)> = self
      .properties
      .iter()
      .filter_map(|(name, terms)| {
        let index = name.strip_prefix(RDF_MEMBER_PREFIX)?.parse().ok()?;
        Some((index, terms.first()?))
      })
      .collect();
    members.sort_by_key(|(index, _)| *index);
    members.into_iter().map(|(_, term)| term).collect()
  }

  /// Non-empty URI values of all properties.
  pub fn references(&self) -> impl Iterator<Item = &str> {
    self
      .properties
      .values()
      .flatten()
      .filter(|t| t.is_uri() && !t.value.is_empty())
      .map(|t| t.value.as_str())
  }
}

/// A parsed linked-data document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
  subjects: Vec<Subject>,
}

impl Document {
  pub fn from_value(value: &Value) -> Self {
    let subjects = value
      .as_object()
      .map(|obj| {
        obj
          .iter()
          .map(|(url, props)| Subject::from_value(url, props))
          .collect()
      })
      .unwrap_or_default();
    Self { subjects }
  }

  pub fn is_empty(&self) -> bool {
    self.subjects.is_empty()
  }

  pub fn subjects(&self) -> impl Iterator<Item = &Subject> {
    self.subjects.iter()
  }

  /// Find a subject by URL. Hosts and format extensions are ignored, so a
  /// canonical URL finds the subject keyed by its linked-data form.
  pub fn subject(&self, url: &str) -> Option<&Subject> {
    let key = path_key(url)?;
    self
      .subjects
      .iter()
      .find(|s| path_key(&s.url).as_deref() == Some(key.as_str()))
  }

  /// Distinct URI values referenced anywhere in the document, in document
  /// order.
  pub fn references(&self) -> Vec<&str> {
    let mut seen = HashSet::new();
    self
      .subjects
      .iter()
      .flat_map(Subject::references)
      .filter(|url| seen.insert(*url))
      .collect()
  }
}

fn path_key(url: &str) -> Option<String> {
  let url = Url::parse(url).ok()?;
  let path = url.path().trim_end_matches('/');
  let name_start = path.rfind('/').map_or(0, |i| i + 1);
  let key = match path[name_start..].rfind('.') {
    Some(dot) if dot > 0 => &path[..name_start + dot],
    _ => path,
  };
  Some(key.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  const LIST: &str = "http://uni.myreadinglists.org/lists/L1";

  fn document() -> Document {
    Document::from_value(&json!({
      LIST: {
        (props::NAME): [{"type": "literal", "value": "Reading for Physics 101"}],
        (props::LAST_UPDATED): [{"type": "literal", "value": "2017-03-01T10:20:30+00:00"}],
        (props::CREATED): {"type": "literal", "value": "2016-09-01"},
        (props::USED_BY): [
          {"type": "uri", "value": "http://uni.myreadinglists.org/modules/M1"},
          {"type": "uri", "value": ""}
        ],
        "http://example.com/published": [{"type": "literal", "value": "true"}],
        "http://www.w3.org/1999/02/22-rdf-syntax-ns#_10": [
          {"type": "uri", "value": "http://uni.myreadinglists.org/items/I10"}
        ],
        "http://www.w3.org/1999/02/22-rdf-syntax-ns#_2": [
          {"type": "uri", "value": "http://uni.myreadinglists.org/items/I2"}
        ],
        "http://example.com/count": [{"type": "literal", "value": 3}],
        "http://example.com/broken": [{"type": "literal"}, "nonsense"]
      },
      "http://uni.myreadinglists.org/items/I2": {
        "http://example.com/resource": [
          {"type": "uri", "value": "http://uni.myreadinglists.org/modules/M1"},
          {"type": "bnode", "value": "_:b0"}
        ]
      }
    }))
  }

  #[test]
  fn test_scalar_values() {
    let doc = document();
    let list = doc.subject(LIST).unwrap();
    assert_eq!(list.scalar(props::NAME), Some("Reading for Physics 101"));
    assert_eq!(list.scalar("http://example.com/count"), Some("3"));
    assert_eq!(list.scalar("http://example.com/missing"), None);
    assert!(list.values("http://example.com/broken").is_empty());
  }

  #[test]
  fn test_dates_and_booleans() {
    let doc = document();
    let list = doc.subject(LIST).unwrap();
    let updated = list.date(props::LAST_UPDATED).unwrap();
    assert_eq!(updated.timestamp(), 1_488_363_630);
    let created = list.date(props::CREATED).unwrap();
    assert_eq!(created.to_rfc3339(), "2016-09-01T00:00:00+00:00");
    assert_eq!(list.boolean("http://example.com/published"), Some(true));
    assert_eq!(list.boolean(props::NAME), None);
  }

  #[test]
  fn test_sequence_is_ordered_numerically() {
    let doc = document();
    let items: Vec<&str> = doc
      .subject(LIST)
      .unwrap()
      .sequence()
      .into_iter()
      .map(|t| t.value.as_str())
      .collect();
    assert_eq!(
      items,
      vec![
        "http://uni.myreadinglists.org/items/I2",
        "http://uni.myreadinglists.org/items/I10",
      ]
    );
  }

  #[test]
  fn test_subject_lookup_ignores_host_and_format() {
    let doc = document();
    let found = doc.subject("https://uni.rl.talis.com/lists/L1.json").unwrap();
    assert_eq!(found.url, LIST);
    assert!(doc.subject("https://uni.rl.talis.com/lists/L2.json").is_none());
  }

  #[test]
  fn test_references_are_distinct_uris() {
    let doc = document();
    let mut refs = doc.references();
    refs.sort_unstable();
    assert_eq!(
      refs,
      vec![
        "http://uni.myreadinglists.org/items/I10",
        "http://uni.myreadinglists.org/items/I2",
        "http://uni.myreadinglists.org/modules/M1",
      ]
    );
  }

  #[test]
  fn test_non_object_document_is_empty() {
    assert!(Document::from_value(&json!([1, 2, 3])).is_empty());
    assert!(Document::from_value(&json!({})).is_empty());
  }
}
