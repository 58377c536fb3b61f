// Query Key Builder
// Cache key namespace shared with existing dashboard and listing consumers. The
// exact strings below are part of the external interface.

use serde::{Deserialize, Serialize};

pub const LATEST_PRODUCTS_KEY: &str = "latest-products";
pub const CATEGORIES_KEY: &str = "categories";
pub const ALL_PRODUCTS_KEY: &str = "all-products";
pub const ALL_ORDERS_KEY: &str = "all-orders";

pub const ADMIN_STATS_KEY: &str = "admin-stats";
pub const ADMIN_PIE_CHARTS_KEY: &str = "admin-pie-charts";
pub const ADMIN_BAR_CHARTS_KEY: &str = "admin-bar-charts";
pub const ADMIN_LINE_CHARTS_KEY: &str = "admin-line-charts";

pub const ADMIN_KEYS: [&str; 4] = [
    ADMIN_STATS_KEY,
    ADMIN_PIE_CHARTS_KEY,
    ADMIN_BAR_CHARTS_KEY,
    ADMIN_LINE_CHARTS_KEY,
];

const LISTING_PREFIX: &str = "products";
const SEPARATOR: char = '-';
// Stands in for an absent optional field; escaping keeps it out of present values
const ABSENT: &str = "_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }

    // Unrecognised values mean "unsorted", as in the query string handling
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" => Some(SortDirection::Asc),
            "desc" => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

// Filters of a paginated product listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingFilter {
    pub search: Option<String>,
    pub sort: Option<SortDirection>,
    pub category: Option<String>,
    pub max_price: Option<f64>,
    pub page: u32,
}

impl Default for ListingFilter {
    fn default() -> Self {
        Self {
            search: None,
            sort: None,
            category: None,
            max_price: None,
            page: 1,
        }
    }
}

impl ListingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn with_sort(mut self, sort: SortDirection) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_max_price(mut self, max_price: f64) -> Self {
        self.max_price = Some(max_price);
        self
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    // Empty text filters are not applied, pages start at 1 and a -0.0 price
    // cap is the same cap as 0.0
    pub fn normalized(&self) -> Self {
        Self {
            search: non_empty(&self.search),
            sort: self.sort,
            category: non_empty(&self.category),
            max_price: self.max_price.map(|p| p + 0.0),
            page: self.page.max(1),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}

/// Derives the cache key of a listing page.
///
/// Field order is fixed: `products-{search}-{sort}-{category}-{price}-{page}`.
/// Absent fields become `_`; `%`, `-` and `_` inside present text are
/// percent-escaped so distinct filters never share a key.
pub fn build_listing_key(filter: &ListingFilter) -> String {
    let filter = filter.normalized();

    let fields = [
        filter.search.as_deref().map(escape_field),
        filter.sort.map(|s| s.as_str().to_string()),
        filter.category.as_deref().map(escape_field),
        filter.max_price.map(|p| escape_field(&p.to_string())),
        Some(filter.page.to_string()),
    ];

    let mut key = String::from(LISTING_PREFIX);
    for field in fields {
        key.push(SEPARATOR);
        key.push_str(field.as_deref().unwrap_or(ABSENT));
    }
    key
}

pub fn product_key(id: &str) -> String {
    format!("product-{}", id)
}

pub fn reviews_key(product_id: &str) -> String {
    format!("reviews-{}", product_id)
}

pub fn order_key(order_id: &str) -> String {
    format!("order-{}", order_id)
}

pub fn my_orders_key(user_id: &str) -> String {
    format!("my-orders-{}", user_id)
}

pub fn is_listing_key(key: &str) -> bool {
    key.starts_with("products-")
}

fn escape_field(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            '-' => escaped.push_str("%2D"),
            '_' => escaped.push_str("%5F"),
            other => escaped.push(other),
        }
    }
    escaped
}
