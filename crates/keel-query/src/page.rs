//! Page requests and page results.
//!
//! Offsets and limits are zero-based row counts. A [`Page`] may carry a
//! total element count or leave it unknown; a [`Slice`] never counts and
//! learns `has_next` by fetching one row past the requested limit.

use crate::clause::Sort;
use crate::query::Window;
use keel_core::ValidationError;
use serde::{Deserialize, Serialize};

/// Which rows of a query to return.
///
/// Raw values are kept signed so that bad input from a request layer is
/// reported by [`PageRequest::validate`] rather than wrapped silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    offset: i64,
    limit: i64,
    #[serde(default)]
    sort: Sort,
}

impl PageRequest {
    /// The `page`-th page (zero-based) of `size` rows.
    pub fn of(page: i64, size: i64) -> Self {
        Self {
            offset: page.saturating_mul(size.max(0)),
            limit: size,
            sort: Sort::unsorted(),
        }
    }

    /// `limit` rows starting at row `offset`.
    pub fn at(offset: i64, limit: i64) -> Self {
        Self {
            offset,
            limit,
            sort: Sort::unsorted(),
        }
    }

    /// Sort applied after the query's own ordering.
    #[must_use]
    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn sort(&self) -> &Sort {
        &self.sort
    }

    /// Reject `limit <= 0` and negative offsets.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut err = ValidationError::new();
        if self.limit <= 0 {
            err.add_page_size(self.limit);
        }
        if self.offset < 0 {
            err.add_offset(self.offset);
        }
        err.into_result()
    }

    /// The validated row window.
    pub fn window(&self) -> Result<Window, ValidationError> {
        self.validate()?;
        Ok(Window {
            offset: self.offset.unsigned_abs(),
            limit: self.limit.unsigned_abs(),
        })
    }

    /// The request for the following page.
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            offset: self.offset.saturating_add(self.limit),
            limit: self.limit,
            sort: self.sort.clone(),
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    content: Vec<T>,
    /// `None` when the total was not counted.
    total: Option<u64>,
    offset: u64,
    limit: u64,
    has_next: bool,
}

impl<T> Page<T> {
    /// A page with a known total; `has_next` follows from it.
    pub fn counted(content: Vec<T>, window: Window, total: u64) -> Self {
        let end = window.offset.saturating_add(content.len() as u64);
        Self {
            content,
            total: Some(total),
            offset: window.offset,
            limit: window.limit,
            has_next: end < total,
        }
    }

    /// A page whose total is unknown.
    ///
    /// A full page is assumed to have a successor.
    pub fn uncounted(content: Vec<T>, window: Window) -> Self {
        let has_next = content.len() as u64 >= window.limit;
        Self {
            content,
            total: None,
            offset: window.offset,
            limit: window.limit,
            has_next,
        }
    }

    /// Clamp the total and `has_next` to a top-N limit on the query.
    #[must_use]
    pub fn capped(mut self, top: Option<u64>) -> Self {
        if let Some(top) = top {
            let end = self.offset.saturating_add(self.content.len() as u64);
            self.total = self.total.map(|t| t.min(top));
            self.has_next = self.has_next && end < top;
        }
        self
    }

    /// Drop content entries, keeping the paging metadata.
    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.content.retain(f);
    }

    pub fn content(&self) -> &[T] {
        &self.content
    }

    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn has_next(&self) -> bool {
        self.has_next
    }

    pub fn is_first(&self) -> bool {
        self.offset == 0
    }

    pub fn is_last(&self) -> bool {
        !self.has_next
    }

    pub fn has_previous(&self) -> bool {
        self.offset > 0
    }

    /// Zero-based page number.
    pub fn number(&self) -> u64 {
        self.offset / self.limit.max(1)
    }

    pub fn number_of_elements(&self) -> usize {
        self.content.len()
    }

    /// Number of pages, when the total is known.
    pub fn total_pages(&self) -> Option<u64> {
        self.total.map(|t| t.div_ceil(self.limit.max(1)))
    }

    /// Convert the content, keeping the paging metadata.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            content: self.content.into_iter().map(f).collect(),
            total: self.total,
            offset: self.offset,
            limit: self.limit,
            has_next: self.has_next,
        }
    }
}

/// Results of a size-unaware query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Slice<T> {
    content: Vec<T>,
    offset: u64,
    limit: u64,
    has_next: bool,
}

impl<T> Slice<T> {
    /// Build from the `limit + 1` probe rows fetched for `window`.
    pub fn from_probe(mut rows: Vec<T>, window: Window) -> Self {
        let limit = usize::try_from(window.limit).unwrap_or(usize::MAX);
        let has_next = rows.len() > limit;
        rows.truncate(limit);
        Self {
            content: rows,
            offset: window.offset,
            limit: window.limit,
            has_next,
        }
    }

    /// The window to query for `window`: one extra row.
    pub fn probe(window: Window) -> Window {
        Window {
            offset: window.offset,
            limit: window.limit.saturating_add(1),
        }
    }

    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.content.retain(f);
    }

    pub fn content(&self) -> &[T] {
        &self.content
    }

    pub fn into_content(self) -> Vec<T> {
        self.content
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn has_next(&self) -> bool {
        self.has_next
    }

    pub fn is_first(&self) -> bool {
        self.offset == 0
    }

    pub fn number(&self) -> u64 {
        self.offset / self.limit.max(1)
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Slice<U> {
        Slice {
            content: self.content.into_iter().map(f).collect(),
            offset: self.offset,
            limit: self.limit,
            has_next: self.has_next,
        }
    }
}

/// The total implied by a short page, when no count query is needed.
///
/// If the page is not full (and either starts at zero or returned rows),
/// the rows end here and the total is `offset + len`.
pub fn total_without_count(window: Window, returned: usize) -> Option<u64> {
    let returned = returned as u64;
    if returned < window.limit && (window.offset == 0 || returned > 0) {
        Some(window.offset + returned)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ValidationErrorKind;

    fn window(offset: u64, limit: u64) -> Window {
        Window { offset, limit }
    }

    #[test]
    fn request_validation() {
        assert!(PageRequest::at(0, 3).validate().is_ok());

        let err = PageRequest::at(0, 0).validate().unwrap_err();
        assert_eq!(err.first_kind(), Some(ValidationErrorKind::InvalidPageSize));

        let err = PageRequest::at(-1, -5).validate().unwrap_err();
        assert_eq!(err.errors.len(), 2);
        assert_eq!(err.errors[1].kind, ValidationErrorKind::InvalidOffset);
    }

    #[test]
    fn page_numbers_map_to_offsets() {
        let req = PageRequest::of(2, 3);
        assert_eq!(req.offset(), 6);
        assert_eq!(req.window().unwrap(), window(6, 3));
        assert_eq!(req.next().offset(), 9);
        assert_eq!(PageRequest::of(1, 3).with_sort(Sort::desc("age")).sort(), &Sort::desc("age"));
    }

    #[test]
    fn counted_page_flags() {
        let first = Page::counted(vec![1, 2, 3], window(0, 3), 6);
        assert!(first.is_first());
        assert!(first.has_next());
        assert!(!first.has_previous());
        assert_eq!(first.total_pages(), Some(2));
        assert_eq!(first.number(), 0);

        let second = Page::counted(vec![4, 5, 6], window(3, 3), 6);
        assert!(!second.is_first());
        assert!(!second.has_next());
        assert!(second.is_last());
        assert_eq!(second.number(), 1);
    }

    #[test]
    fn uncounted_page_and_map() {
        let page = Page::uncounted(vec![1, 2], window(0, 3));
        assert_eq!(page.total(), None);
        assert!(!page.has_next());
        let strings = page.map(|n| n.to_string());
        assert_eq!(strings.content(), ["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn top_limit_caps_total_and_has_next() {
        let first = Page::counted(vec![1, 2, 3], window(0, 3), 12).capped(Some(3));
        assert_eq!(first.total(), Some(3));
        assert!(!first.has_next());

        let uncounted = Page::uncounted(vec![1, 2, 3], window(0, 3)).capped(Some(3));
        assert!(!uncounted.has_next());

        let below = Page::counted(vec![1, 2, 3], window(0, 3), 12).capped(Some(5));
        assert_eq!(below.total(), Some(5));
        assert!(below.has_next());
    }

    #[test]
    fn retain_keeps_metadata() {
        let mut page = Page::counted(vec![1, 2, 3], window(0, 3), 6);
        page.retain(|n| *n != 2);
        assert_eq!(page.content(), [1, 3]);
        assert_eq!(page.total(), Some(6));
        assert!(page.has_next());
    }

    #[test]
    fn slice_from_probe() {
        let probe = Slice::<i32>::probe(window(0, 3));
        assert_eq!(probe.limit, 4);

        let slice = Slice::from_probe(vec![1, 2, 3, 4], window(0, 3));
        assert!(slice.has_next());
        assert_eq!(slice.content(), [1, 2, 3]);

        let last = Slice::from_probe(vec![4, 5], window(3, 3));
        assert!(!last.has_next());
        assert_eq!(last.content().len(), 2);
    }

    #[test]
    fn short_pages_imply_total() {
        assert_eq!(total_without_count(window(0, 3), 2), Some(2));
        assert_eq!(total_without_count(window(3, 3), 1), Some(4));
        assert_eq!(total_without_count(window(0, 3), 3), None);
        assert_eq!(total_without_count(window(6, 3), 0), None);
    }

    #[test]
    fn page_serializes_to_json() {
        let page = Page::counted(vec!["a"], window(0, 1), 1);
        let json = serde_json::to_value(&page).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["has_next"], false);
    }
}
