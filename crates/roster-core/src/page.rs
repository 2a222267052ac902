//! Token-based pagination shared by record and audit listings.

use serde::{Deserialize, Serialize};

use crate::validation::ValidationError;

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: usize = 25;

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: usize = 100;

/// Opaque continuation token handed back with a page.
///
/// Callers must treat the content as opaque; stores encode their last
/// returned key in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(String);

impl PageToken {
    /// Wraps an encoded position.
    #[must_use]
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Returns the encoded position.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A bounded request for one page of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Maximum items to return.
    pub limit: usize,
    /// Where to continue from; `None` starts at the beginning.
    pub token: Option<PageToken>,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            token: None,
        }
    }
}

impl PageRequest {
    /// Builds a request from optional caller input.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `limit` is zero or above [`MAX_PAGE_SIZE`].
    pub fn new(limit: Option<usize>, token: Option<PageToken>) -> Result<Self, ValidationError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(ValidationError::range(
                "limit",
                format!("must be between 1 and {MAX_PAGE_SIZE}"),
            ));
        }
        Ok(Self { limit, token })
    }

    /// Returns a request for the page after `token`, keeping the limit.
    #[must_use]
    pub fn after(&self, token: PageToken) -> Self {
        Self {
            limit: self.limit,
            token: Some(token),
        }
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,

    /// Token for the next page, absent on the last page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<PageToken>,
}

impl<T> Page<T> {
    /// Creates a page.
    #[must_use]
    pub fn new(items: Vec<T>, next_token: Option<PageToken>) -> Self {
        Self { items, next_token }
    }

    /// Returns true if more results follow.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.next_token.is_some()
    }
}
