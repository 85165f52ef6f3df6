//! Response extraction
//!
//! Turns one response message into data rows and raw error elements for the
//! dispatcher to classify. Message names are matched per request kind; a
//! name with no handler yields `None` and the dispatcher treats the message
//! as malformed.

use crate::handle::Row;
use crate::request::RequestKind;
use router_types::{Element, ErrorScope, Message, SchemaError};

/// Error element found in a message, not yet classified
#[derive(Debug, Clone, PartialEq)]
pub struct RawError {
    pub scope: ErrorScope,
    pub security: Option<String>,
    pub field: Option<String>,
    pub element: Element,
}

impl RawError {
    fn request(element: &Element) -> Self {
        Self {
            scope: ErrorScope::Request,
            security: None,
            field: None,
            element: element.clone(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Extracted {
    pub rows: Vec<(String, Row)>,
    pub errors: Vec<RawError>,
}

pub fn extract(kind: RequestKind, msg: &Message) -> Result<Option<Extracted>, SchemaError> {
    match msg.name.as_str() {
        "responseError" => Ok(Some(request_error(msg, "responseError"))),
        "RequestFailure" => Ok(Some(request_error(msg, "reason"))),
        "ReferenceDataResponse" if kind == RequestKind::ReferenceData => {
            reference_data(msg.payload()).map(Some)
        }
        "fieldResponse" if kind == RequestKind::FieldSearch => field_search(msg.payload()).map(Some),
        "InstrumentListResponse" if kind == RequestKind::InstrumentLookup => {
            instrument_list(msg.payload()).map(Some)
        }
        _ => Ok(None),
    }
}

/// Row of a subscription data message: every child of the payload
pub fn subscription_row(msg: &Message) -> Result<Row, SchemaError> {
    Ok(msg.payload().children()?.clone())
}

fn request_error(msg: &Message, child: &str) -> Extracted {
    let element = msg.element.get(child).unwrap_or(&msg.element);
    Extracted {
        rows: Vec::new(),
        errors: vec![RawError::request(element)],
    }
}

fn reference_data(payload: &Element) -> Result<Extracted, SchemaError> {
    let mut out = Extracted::default();
    if let Some(error) = payload.get("responseError") {
        out.errors.push(RawError::request(error));
        return Ok(out);
    }

    for item in payload.array_or_empty("securityData")? {
        let security = item.child_str("security")?;

        if let Some(error) = item.get("securityError") {
            out.errors.push(RawError {
                scope: ErrorScope::Security,
                security: Some(security.to_string()),
                field: None,
                element: error.clone(),
            });
            continue;
        }

        for exception in item.array_or_empty("fieldExceptions")? {
            out.errors.push(RawError {
                scope: ErrorScope::Field,
                security: Some(security.to_string()),
                field: Some(exception.child_str("fieldId")?.to_string()),
                element: exception.get("errorInfo").unwrap_or(exception).clone(),
            });
        }

        let row = match item.get("fieldData") {
            Some(data) => data.children()?.clone(),
            None => Row::new(),
        };
        out.rows.push((security.to_string(), row));
    }
    Ok(out)
}

fn field_search(payload: &Element) -> Result<Extracted, SchemaError> {
    let mut out = Extracted::default();
    for item in payload.array_or_empty("fieldData")? {
        let id = item.child_str("id")?;

        if let Some(error) = item.get("fieldError") {
            out.errors.push(RawError {
                scope: ErrorScope::Field,
                security: None,
                field: Some(id.to_string()),
                element: error.clone(),
            });
            continue;
        }

        let row = match item.get("fieldInfo") {
            Some(info) => info.children()?.clone(),
            None => Row::new(),
        };
        out.rows.push((id.to_string(), row));
    }
    Ok(out)
}

fn instrument_list(payload: &Element) -> Result<Extracted, SchemaError> {
    let mut out = Extracted::default();
    for item in payload.array_or_empty("results")? {
        let security = item.child_str("security")?;
        let row = item
            .children()?
            .iter()
            .filter(|(name, _)| name.as_str() != "security")
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        out.rows.push((security.to_string(), row));
    }
    Ok(out)
}
