//! Error classification
//!
//! Vendor error descriptions are tree elements of the form
//! `{ category, subcategory, message, ... }`, or occasionally a bare string
//! leaf holding the subcategory. Classification is a pure function of that
//! element and the configured list of ignorable subcategories.

use router_config::ClassifierConfig;
use router_types::{Element, ErrorRecord, ErrorScope, ThrottleKind};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Recorded, never fails the request
    Ignorable,
    /// Capacity signal, retried with backoff
    Recoverable(ThrottleKind),
    Fatal,
}

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    ignorable: HashSet<String>,
}

impl ErrorClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        Self {
            ignorable: config.ignorable_subcategories.iter().cloned().collect(),
        }
    }

    pub fn classify(&self, element: &Element) -> Classification {
        let subcategory = subcategory(element);
        let category = element.get_str("category");

        if let Some(kind) = subcategory.and_then(ThrottleKind::from_subcategory) {
            return Classification::Recoverable(kind);
        }
        if category == Some("LIMIT") {
            return Classification::Recoverable(ThrottleKind::RateLimit);
        }
        match subcategory {
            Some(sub) if self.ignorable.contains(sub) => Classification::Ignorable,
            _ => Classification::Fatal,
        }
    }

    /// Classify and describe an error element in one pass
    pub fn record(&self, scope: ErrorScope, element: &Element) -> (Classification, ErrorRecord) {
        let class = self.classify(element);
        let mut record = ErrorRecord::new(scope, describe(element));
        record.category = element.get_str("category").map(str::to_string);
        record.subcategory = subcategory(element).map(str::to_string);
        if let Classification::Recoverable(kind) = class {
            record.throttle = Some(kind);
        }
        (class, record)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

fn subcategory(element: &Element) -> Option<&str> {
    element
        .as_str()
        .ok()
        .or_else(|| element.get_str("subcategory"))
}

/// Human-readable text of an error or status element
pub fn describe(element: &Element) -> String {
    if let Ok(text) = element.as_str() {
        return text.to_string();
    }
    let target = element.get("reason").filter(|r| r.is_node()).unwrap_or(element);
    ["message", "description", "subcategory", "category"]
        .iter()
        .find_map(|name| target.get_str(name))
        .unwrap_or("unspecified error")
        .to_string()
}
