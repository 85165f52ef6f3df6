//! Tree-shaped message payloads
//!
//! Vendor messages carry arbitrarily nested, named child elements. They are
//! modelled as a tagged variant:
//!
//! ```text
//! Element = Leaf(Value) | Array([Element]) | Node({name -> Element})
//! ```
//!
//! Accessors return `SchemaError` on shape mismatch so that parsing code can
//! propagate with `?` instead of probing attributes.

use crate::errors::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Scalar carried by a leaf element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    /// Short name of the variant, used in schema errors
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// A node in a message payload tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Element {
    Leaf(Value),
    Array(Vec<Element>),
    Node(BTreeMap<String, Element>),
}

impl Element {
    /// Leaf element holding a null value
    pub fn null() -> Self {
        Element::Leaf(Value::Null)
    }

    pub fn leaf(value: impl Into<Value>) -> Self {
        Element::Leaf(value.into())
    }

    /// Build a node from `(name, child)` pairs; later duplicates win
    pub fn node<K: Into<String>>(children: impl IntoIterator<Item = (K, Element)>) -> Self {
        Element::Node(
            children
                .into_iter()
                .map(|(name, child)| (name.into(), child))
                .collect(),
        )
    }

    pub fn array(items: impl IntoIterator<Item = Element>) -> Self {
        Element::Array(items.into_iter().collect())
    }

    /// Node with no children
    pub fn empty_node() -> Self {
        Element::Node(BTreeMap::new())
    }

    /// Short name of the variant, used in schema errors
    pub fn kind_name(&self) -> &'static str {
        match self {
            Element::Leaf(value) => value.kind_name(),
            Element::Array(_) => "array",
            Element::Node(_) => "node",
        }
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Element::Node(_))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Element::Leaf(_))
    }

    /// Child lookup that tolerates any shape; `None` when absent or not a node
    pub fn get(&self, name: &str) -> Option<&Element> {
        match self {
            Element::Node(children) => children.get(name),
            _ => None,
        }
    }

    /// Required child lookup
    pub fn child(&self, name: &str) -> Result<&Element, SchemaError> {
        match self {
            Element::Node(children) => {
                children
                    .get(name)
                    .ok_or_else(|| SchemaError::MissingChild {
                        name: name.to_string(),
                    })
            }
            other => Err(SchemaError::mismatch("node", other.kind_name())),
        }
    }

    /// Follow a path of child names from this element
    pub fn at(&self, path: &[&str]) -> Result<&Element, SchemaError> {
        path.iter().try_fold(self, |element, name| element.child(name))
    }

    pub fn children(&self) -> Result<&BTreeMap<String, Element>, SchemaError> {
        match self {
            Element::Node(children) => Ok(children),
            other => Err(SchemaError::mismatch("node", other.kind_name())),
        }
    }

    pub fn as_array(&self) -> Result<&[Element], SchemaError> {
        match self {
            Element::Array(items) => Ok(items),
            other => Err(SchemaError::mismatch("array", other.kind_name())),
        }
    }

    pub fn as_value(&self) -> Result<&Value, SchemaError> {
        match self {
            Element::Leaf(value) => Ok(value),
            other => Err(SchemaError::mismatch("leaf", other.kind_name())),
        }
    }

    pub fn as_str(&self) -> Result<&str, SchemaError> {
        match self.as_value()? {
            Value::String(s) => Ok(s),
            other => Err(SchemaError::mismatch("string", other.kind_name())),
        }
    }

    /// Numeric value; integers are widened
    pub fn as_f64(&self) -> Result<f64, SchemaError> {
        match self.as_value()? {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            other => Err(SchemaError::mismatch("float", other.kind_name())),
        }
    }

    pub fn as_i64(&self) -> Result<i64, SchemaError> {
        match self.as_value()? {
            Value::Int(v) => Ok(*v),
            other => Err(SchemaError::mismatch("int", other.kind_name())),
        }
    }

    pub fn as_bool(&self) -> Result<bool, SchemaError> {
        match self.as_value()? {
            Value::Bool(v) => Ok(*v),
            other => Err(SchemaError::mismatch("bool", other.kind_name())),
        }
    }

    /// Required string child, the most common access in response parsing
    pub fn child_str(&self, name: &str) -> Result<&str, SchemaError> {
        self.child(name)?.as_str()
    }

    /// Optional string child; absent children and non-string leaves give `None`
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|child| child.as_str().ok())
    }

    /// Items of an optional array child; an absent child is an empty slice
    pub fn array_or_empty(&self, name: &str) -> Result<&[Element], SchemaError> {
        match self.get(name) {
            Some(child) => child.as_array(),
            None => Ok(&[]),
        }
    }
}

macro_rules! leaf_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Element {
                fn from(value: $ty) -> Self {
                    Element::Leaf(Value::from(value))
                }
            }
        )*
    };
}

leaf_from!(bool, i64, i32, u32, f64, &str, String);

impl From<Value> for Element {
    fn from(value: Value) -> Self {
        Element::Leaf(value)
    }
}
