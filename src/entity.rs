//! Entities read from the property graph.
//!
//! Property bags are modelled as a tagged union so the value matcher can
//! dispatch exhaustively on scalar, list and nested shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single property value on a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    /// True for null, blank strings, empty lists and empty maps.
    pub fn is_empty(&self) -> bool {
        match self {
            PropertyValue::Null => true,
            PropertyValue::Text(s) => s.trim().is_empty(),
            PropertyValue::List(items) => items.iter().all(PropertyValue::is_empty),
            PropertyValue::Map(map) => map.is_empty(),
            PropertyValue::Bool(_) | PropertyValue::Integer(_) | PropertyValue::Float(_) => false,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self,
            PropertyValue::Bool(_)
                | PropertyValue::Integer(_)
                | PropertyValue::Float(_)
                | PropertyValue::Text(_)
        )
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PropertyValue]> {
        match self {
            PropertyValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Scalar rendered as text; `None` for null, lists and maps.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            PropertyValue::Text(s) => Some(s.trim().to_string()),
            PropertyValue::Integer(i) => Some(i.to_string()),
            PropertyValue::Float(f) => Some(f.to_string()),
            PropertyValue::Bool(b) => Some(b.to_string()),
            PropertyValue::Null | PropertyValue::List(_) | PropertyValue::Map(_) => None,
        }
    }

    /// Non-empty scalar strings contained in this value: the scalar itself,
    /// or each scalar element of a list. Nested maps contribute nothing.
    pub fn search_terms(&self) -> Vec<String> {
        match self {
            PropertyValue::List(items) => items
                .iter()
                .filter_map(PropertyValue::scalar_string)
                .filter(|s| !s.is_empty())
                .collect(),
            other => other
                .scalar_string()
                .filter(|s| !s.is_empty())
                .into_iter()
                .collect(),
        }
    }

    /// Human readable rendering used in example matches and prompts.
    pub fn display_string(&self) -> String {
        match self {
            PropertyValue::List(items) => {
                let parts: Vec<String> = items.iter().map(PropertyValue::display_string).collect();
                format!("[{}]", parts.join(", "))
            }
            PropertyValue::Map(_) => serde_json::to_string(self).unwrap_or_default(),
            PropertyValue::Null => String::new(),
            scalar => scalar.scalar_string().unwrap_or_default(),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(values: Vec<T>) -> Self {
        PropertyValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// A node in the property graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    /// Ordered property names forming the main identity key.
    #[serde(default)]
    pub primary_key_properties: Vec<String>,
    /// Alternate identity keys, each a set of property names.
    #[serde(default)]
    pub additional_key_properties: Vec<Vec<String>>,
    #[serde(default)]
    pub all_properties: BTreeMap<String, PropertyValue>,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            primary_key_properties: Vec::new(),
            additional_key_properties: Vec::new(),
            all_properties: BTreeMap::new(),
        }
    }

    pub fn with_primary_key<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key_properties = properties.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_additional_key<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.additional_key_properties
            .push(properties.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.all_properties.insert(name.into(), value.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.all_properties.get(name)
    }

    /// Property value, treating empty values as absent.
    pub fn non_empty_property(&self, name: &str) -> Option<&PropertyValue> {
        self.property(name).filter(|v| !v.is_empty())
    }
}
