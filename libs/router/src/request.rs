//! Request kinds and their vendor wire form
//!
//! A caller-facing [`RequestSpec`] describes one logical request. Before
//! submission it is split into one or more vendor [`Request`]s, each of which
//! gets its own correlation id.

use crate::error::{Result, RouterError};
use router_types::Element;

pub const REFDATA_SERVICE: &str = "//blp/refdata";
pub const FIELDS_SERVICE: &str = "//blp/apiflds";
pub const INSTRUMENTS_SERVICE: &str = "//blp/instruments";
pub const MKTDATA_SERVICE: &str = "//blp/mktdata";

/// Which response shape a request produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    ReferenceData,
    FieldSearch,
    InstrumentLookup,
}

/// One vendor request as handed to the session
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub kind: RequestKind,
    pub service: &'static str,
    pub operation: &'static str,
    pub element: Element,
}

/// Reference data for a set of securities and fields
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReferenceDataRequest {
    pub securities: Vec<String>,
    pub fields: Vec<String>,
    pub overrides: Vec<(String, String)>,
}

impl ReferenceDataRequest {
    pub fn new<S, F>(
        securities: impl IntoIterator<Item = S>,
        fields: impl IntoIterator<Item = F>,
    ) -> Self
    where
        S: Into<String>,
        F: Into<String>,
    {
        Self {
            securities: securities.into_iter().map(Into::into).collect(),
            fields: fields.into_iter().map(Into::into).collect(),
            overrides: Vec::new(),
        }
    }

    pub fn with_override(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((field.into(), value.into()));
        self
    }

    fn batch(&self, securities: &[String]) -> Request {
        let overrides = self.overrides.iter().map(|(field, value)| {
            Element::node([
                ("fieldId", Element::from(field.as_str())),
                ("value", Element::from(value.as_str())),
            ])
        });

        Request {
            kind: RequestKind::ReferenceData,
            service: REFDATA_SERVICE,
            operation: "ReferenceDataRequest",
            element: Element::node([
                ("securities", strings(securities)),
                ("fields", strings(&self.fields)),
                ("overrides", Element::array(overrides)),
            ]),
        }
    }
}

/// Field metadata search; one sub-request per query
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldSearchRequest {
    pub queries: Vec<String>,
}

impl FieldSearchRequest {
    pub fn new<Q: Into<String>>(queries: impl IntoIterator<Item = Q>) -> Self {
        Self {
            queries: queries.into_iter().map(Into::into).collect(),
        }
    }
}

/// Security lookup by free-text query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentLookupRequest {
    pub query: String,
    /// Restrict results to one yellow key, e.g. `Equity` or `Corp`
    pub yellow_key: Option<String>,
    pub max_results: u32,
}

impl InstrumentLookupRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            yellow_key: None,
            max_results: 10,
        }
    }

    pub fn with_yellow_key(mut self, yellow_key: impl Into<String>) -> Self {
        self.yellow_key = Some(yellow_key.into());
        self
    }

    pub fn with_max_results(mut self, max_results: u32) -> Self {
        self.max_results = max_results;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestSpec {
    ReferenceData(ReferenceDataRequest),
    FieldSearch(FieldSearchRequest),
    InstrumentLookup(InstrumentLookupRequest),
}

impl RequestSpec {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestSpec::ReferenceData(_) => RequestKind::ReferenceData,
            RequestSpec::FieldSearch(_) => RequestKind::FieldSearch,
            RequestSpec::InstrumentLookup(_) => RequestKind::InstrumentLookup,
        }
    }

    pub fn service(&self) -> &'static str {
        match self {
            RequestSpec::ReferenceData(_) => REFDATA_SERVICE,
            RequestSpec::FieldSearch(_) => FIELDS_SERVICE,
            RequestSpec::InstrumentLookup(_) => INSTRUMENTS_SERVICE,
        }
    }

    /// Columns every row is expected to carry
    pub fn requested_fields(&self) -> &[String] {
        match self {
            RequestSpec::ReferenceData(request) => &request.fields,
            _ => &[],
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            RequestSpec::ReferenceData(request) => {
                if request.securities.is_empty() {
                    return Err(RouterError::InvalidRequest("no securities requested".into()));
                }
                if request.fields.is_empty() {
                    return Err(RouterError::InvalidRequest("no fields requested".into()));
                }
            }
            RequestSpec::FieldSearch(request) => {
                if request.queries.is_empty() {
                    return Err(RouterError::InvalidRequest("no search queries".into()));
                }
            }
            RequestSpec::InstrumentLookup(request) => {
                if request.query.trim().is_empty() {
                    return Err(RouterError::InvalidRequest("empty lookup query".into()));
                }
            }
        }
        Ok(())
    }

    /// Vendor requests for this spec, each submitted under its own correlation id
    pub fn split(&self, max_securities_per_request: usize) -> Vec<Request> {
        match self {
            RequestSpec::ReferenceData(request) => request
                .securities
                .chunks(max_securities_per_request.max(1))
                .map(|batch| request.batch(batch))
                .collect(),
            RequestSpec::FieldSearch(request) => request
                .queries
                .iter()
                .map(|query| Request {
                    kind: RequestKind::FieldSearch,
                    service: FIELDS_SERVICE,
                    operation: "FieldSearchRequest",
                    element: Element::node([
                        ("searchSpec", Element::from(query.as_str())),
                        ("returnFieldDocumentation", Element::from(false)),
                    ]),
                })
                .collect(),
            RequestSpec::InstrumentLookup(request) => {
                let mut element = vec![
                    ("query", Element::from(request.query.as_str())),
                    ("maxResults", Element::from(request.max_results)),
                ];
                if let Some(yellow_key) = &request.yellow_key {
                    element.push((
                        "yellowKeyFilter",
                        Element::from(format!("YK_FILTER_{}", yellow_key.to_ascii_uppercase())),
                    ));
                }
                vec![Request {
                    kind: RequestKind::InstrumentLookup,
                    service: INSTRUMENTS_SERVICE,
                    operation: "instrumentListRequest",
                    element: Element::node(element),
                }]
            }
        }
    }
}

impl From<ReferenceDataRequest> for RequestSpec {
    fn from(request: ReferenceDataRequest) -> Self {
        RequestSpec::ReferenceData(request)
    }
}

impl From<FieldSearchRequest> for RequestSpec {
    fn from(request: FieldSearchRequest) -> Self {
        RequestSpec::FieldSearch(request)
    }
}

impl From<InstrumentLookupRequest> for RequestSpec {
    fn from(request: InstrumentLookupRequest) -> Self {
        RequestSpec::InstrumentLookup(request)
    }
}

fn strings(values: &[String]) -> Element {
    Element::array(values.iter().map(|value| Element::from(value.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_data_split_into_batches() {
        let securities: Vec<String> = (0..5).map(|n| format!("SEC{} Equity", n)).collect();
        let spec = RequestSpec::from(ReferenceDataRequest::new(securities, ["PX_LAST"]));

        let requests = spec.split(2);
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.operation == "ReferenceDataRequest"));
        assert!(requests.iter().all(|r| r.service == REFDATA_SERVICE));

        let last = requests[2].element.child("securities").unwrap().as_array().unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].as_str().unwrap(), "SEC4 Equity");
    }

    #[test]
    fn test_overrides_are_encoded() {
        let spec = RequestSpec::from(
            ReferenceDataRequest::new(["F Equity"], ["BEST_EPS"]).with_override("BEST_FPERIOD_OVERRIDE", "1FY"),
        );
        let request = &spec.split(50)[0];
        let overrides = request.element.child("overrides").unwrap().as_array().unwrap();
        assert_eq!(overrides[0].child_str("fieldId").unwrap(), "BEST_FPERIOD_OVERRIDE");
        assert_eq!(overrides[0].child_str("value").unwrap(), "1FY");
    }

    #[test]
    fn test_field_search_one_request_per_query() {
        let spec = RequestSpec::from(FieldSearchRequest::new(["Last Price", "Volume"]));
        let requests = spec.split(50);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].element.child_str("searchSpec").unwrap(), "Volume");
        assert_eq!(spec.service(), FIELDS_SERVICE);
    }

    #[test]
    fn test_instrument_lookup_filter() {
        let spec = RequestSpec::from(
            InstrumentLookupRequest::new("Ford").with_yellow_key("equity").with_max_results(5),
        );
        let requests = spec.split(50);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].element.child_str("yellowKeyFilter").unwrap(), "YK_FILTER_EQUITY");
        assert_eq!(requests[0].element.child("maxResults").unwrap().as_i64().unwrap(), 5);
    }

    #[test]
    fn test_validation() {
        let empty = RequestSpec::from(ReferenceDataRequest::new(Vec::<String>::new(), ["PX_LAST"]));
        assert!(matches!(empty.validate(), Err(RouterError::InvalidRequest(_))));

        let no_fields = RequestSpec::from(ReferenceDataRequest::new(["F Equity"], Vec::<String>::new()));
        assert!(no_fields.validate().is_err());

        assert!(RequestSpec::from(InstrumentLookupRequest::new("  ")).validate().is_err());
        assert!(RequestSpec::from(FieldSearchRequest::new(["PX"])).validate().is_ok());
    }
}
