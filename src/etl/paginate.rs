//! Page requests, responses and the paginator that links them

use crate::resource::ResourceDefinition;

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A single record: one JSON object from a page
pub type Record = Map<String, Value>;

/// Request for one page of a resource
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub resource: Arc<ResourceDefinition>,
    /// 1-based page number, strictly increasing per resource
    pub page_number: u32,
    /// Query parameters, including the page parameter
    pub params: BTreeMap<String, String>,
}

/// One decoded page of records
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageResponse {
    pub records: Vec<Record>,
    /// Set by [`Paginator::inspect`]
    pub has_more: bool,
}

impl PageResponse {
    /// Wrap decoded records. `has_more` stays false until a paginator inspects the page.
    pub fn new(records: Vec<Record>) -> Self {
        Self {
            records,
            has_more: false,
        }
    }
}

/// Next step decided by a paginator
#[derive(Debug, Clone, PartialEq)]
pub enum PageStep {
    Request(PageRequest),
    Done,
}

/// Paginator trait deciding which page comes next
///
/// Paginators hold no per-resource state; the extractor passes the previous
/// request and response back in. No retry logic lives here.
pub trait Paginator: Send + Sync {
    /// Decide whether more pages follow this one
    fn inspect(&self, response: &mut PageResponse);

    /// Compute the next request, or `Done`
    ///
    /// `previous` is `None` on the first call.
    fn next(
        &self,
        resource: &Arc<ResourceDefinition>,
        previous: Option<(&PageRequest, &PageResponse)>,
    ) -> PageStep;
}

/// Page-number pagination without a total count
///
/// Any non-empty page means more pages may follow, so every resource ends
/// with one request for an empty page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageNumberPaginator {
    base_page: u32,
    page_param: String,
}

impl Default for PageNumberPaginator {
    fn default() -> Self {
        Self {
            base_page: 1,
            page_param: "page".to_string(),
        }
    }
}

impl PageNumberPaginator {
    pub fn new(page_param: impl Into<String>) -> Self {
        Self {
            page_param: page_param.into(),
            ..Self::default()
        }
    }

    pub fn page_param(&self) -> &str {
        &self.page_param
    }

    fn request(&self, resource: &Arc<ResourceDefinition>, page_number: u32) -> PageRequest {
        let mut params = resource.params.clone();
        params.insert(self.page_param.clone(), page_number.to_string());
        PageRequest {
            resource: Arc::clone(resource),
            page_number,
            params,
        }
    }
}

impl Paginator for PageNumberPaginator {
    fn inspect(&self, response: &mut PageResponse) {
        response.has_more = !response.records.is_empty();
    }

    fn next(
        &self,
        resource: &Arc<ResourceDefinition>,
        previous: Option<(&PageRequest, &PageResponse)>,
    ) -> PageStep {
        match previous {
            None => PageStep::Request(self.request(resource, self.base_page)),
            Some((request, response)) if response.has_more => {
                PageStep::Request(self.request(resource, request.page_number + 1))
            }
            Some(_) => PageStep::Done,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn resource() -> Arc<ResourceDefinition> {
        Arc::new(ResourceDefinition::new("customers", "/customers").with_param("size", "100"))
    }

    #[test]
    fn test_first_request_is_page_one() {
        let paginator = PageNumberPaginator::default();
        let PageStep::Request(request) = paginator.next(&resource(), None) else {
            panic!("expected a request");
        };
        assert_eq!(request.page_number, 1);
        assert_eq!(request.params.get("page").map(String::as_str), Some("1"));
        // Resource params are carried verbatim
        assert_eq!(request.params.get("size").map(String::as_str), Some("100"));
    }

    #[test]
    fn test_pages_increase_without_gaps_until_empty() {
        let paginator = PageNumberPaginator::default();
        let resource = resource();
        let pages = [2usize, 2, 1, 0];

        let mut seen = Vec::new();
        let mut step = paginator.next(&resource, None);
        let mut index = 0;
        while let PageStep::Request(request) = step {
            seen.push(request.page_number);
            let records = (0..pages[index]).map(|i| record(json!({ "id": i }))).collect();
            let mut response = PageResponse::new(records);
            paginator.inspect(&mut response);
            step = paginator.next(&resource, Some((&request, &response)));
            index += 1;
        }

        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_first_page_is_done() {
        let paginator = PageNumberPaginator::default();
        let resource = resource();
        let PageStep::Request(request) = paginator.next(&resource, None) else {
            panic!("expected a request");
        };

        let mut response = PageResponse::new(Vec::new());
        paginator.inspect(&mut response);
        assert!(!response.has_more);
        assert_eq!(
            paginator.next(&resource, Some((&request, &response))),
            PageStep::Done
        );
    }

    #[test]
    fn test_custom_page_param() {
        let paginator = PageNumberPaginator::new("p");
        let PageStep::Request(request) = paginator.next(&resource(), None) else {
            panic!("expected a request");
        };
        assert_eq!(request.params.get("p").map(String::as_str), Some("1"));
        assert!(!request.params.contains_key("page"));
    }
}
