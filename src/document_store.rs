// Document store collaborator
// Durable storage is external; the core only needs the narrow query surface
// below. InMemoryDocumentStore backs tests and local runs.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use thiserror::Error;

use crate::analytics::{DateRange, Timestamped};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Document store unavailable: {0}")]
    Unavailable(String),

    #[error("Document store query failed: {0}")]
    Query(String),
}

// Photos are uploaded by the object store collaborator before reaching the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub url: String,
    pub public_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub stock: u32,
    pub category: String,
    pub description: String,
    pub photos: Vec<Photo>,
    pub ratings: u32,
    pub num_of_reviews: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub product_id: String,
    pub user_id: String,
    pub rating: u8,
    pub comment: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub gender: Gender,
    pub role: Role,
    pub dob: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl User {
    // Completed years on `today`
    pub fn age_on(&self, today: NaiveDate) -> u32 {
        let mut age = today.year() - self.dob.year();
        if (today.month(), today.day()) < (self.dob.month(), self.dob.day()) {
            age -= 1;
        }
        age.max(0) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Processing,
    Shipped,
    Delivered,
}

impl OrderStatus {
    // Fulfillment moves one step at a time; Delivered is final
    pub fn advance(self) -> Self {
        match self {
            OrderStatus::Processing => OrderStatus::Shipped,
            OrderStatus::Shipped | OrderStatus::Delivered => OrderStatus::Delivered,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    pub name: String,
    pub price: f64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub user_id: String,
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub shipping_charges: f64,
    pub discount: f64,
    pub total: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl Timestamped for Product {
    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Timestamped for User {
    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Timestamped for Order {
    fn timestamp(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductFilter {
    // Case-insensitive match on the product name
    pub name_contains: Option<String>,
    pub category: Option<String>,
    pub max_price: Option<f64>,
    pub created: Option<DateRange>,
    pub out_of_stock: bool,
}

impl ProductFilter {
    pub fn matches(&self, product: &Product) -> bool {
        if let Some(needle) = &self.name_contains {
            if !product
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if &product.category != category {
                return false;
            }
        }
        if let Some(max_price) = self.max_price {
            if product.price > max_price {
                return false;
            }
        }
        if let Some(range) = &self.created {
            if !range.contains(product.created_at) {
                return false;
            }
        }
        !self.out_of_stock || product.stock == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProductSort {
    #[default]
    Unsorted,
    PriceAsc,
    PriceDesc,
    NewestFirst,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductQuery {
    pub filter: ProductFilter,
    pub sort: ProductSort,
    pub skip: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserFilter {
    pub created: Option<DateRange>,
    pub gender: Option<Gender>,
    pub role: Option<Role>,
}

impl UserFilter {
    pub fn matches(&self, user: &User) -> bool {
        self.created.map_or(true, |r| r.contains(user.created_at))
            && self.gender.map_or(true, |g| user.gender == g)
            && self.role.map_or(true, |r| user.role == r)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderFilter {
    pub created: Option<DateRange>,
    pub status: Option<OrderStatus>,
    pub user_id: Option<String>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.created.map_or(true, |r| r.contains(order.created_at))
            && self.status.map_or(true, |s| order.status == s)
            && self.user_id.as_ref().map_or(true, |u| &order.user_id == u)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderQuery {
    pub filter: OrderFilter,
    pub newest_first: bool,
    pub limit: Option<usize>,
}

pub fn new_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn find_products(&self, query: &ProductQuery) -> Result<Vec<Product>, StoreError>;

    async fn count_products(&self, filter: &ProductFilter) -> Result<u64, StoreError>;

    async fn distinct_categories(&self) -> Result<Vec<String>, StoreError>;

    async fn get_product(&self, id: &str) -> Result<Option<Product>, StoreError>;

    async fn insert_product(&self, product: Product) -> Result<Product, StoreError>;

    // Replaces the stored document with the same id
    async fn save_product(&self, product: &Product) -> Result<(), StoreError>;

    async fn delete_product(&self, id: &str) -> Result<bool, StoreError>;

    // Newest update first
    async fn find_reviews(&self, product_id: &str) -> Result<Vec<Review>, StoreError>;

    async fn find_review_by_author(
        &self,
        product_id: &str,
        user_id: &str,
    ) -> Result<Option<Review>, StoreError>;

    async fn get_review(&self, id: &str) -> Result<Option<Review>, StoreError>;

    // Inserts or replaces by id
    async fn save_review(&self, review: &Review) -> Result<(), StoreError>;

    async fn delete_review(&self, id: &str) -> Result<bool, StoreError>;

    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError>;

    async fn insert_user(&self, user: User) -> Result<User, StoreError>;

    async fn delete_user(&self, id: &str) -> Result<bool, StoreError>;

    async fn find_users(&self, filter: &UserFilter) -> Result<Vec<User>, StoreError>;

    async fn count_users(&self, filter: &UserFilter) -> Result<u64, StoreError>;

    async fn find_orders(&self, query: &OrderQuery) -> Result<Vec<Order>, StoreError>;

    async fn count_orders(&self, filter: &OrderFilter) -> Result<u64, StoreError>;

    async fn insert_order(&self, order: Order) -> Result<Order, StoreError>;

    async fn get_order(&self, id: &str) -> Result<Option<Order>, StoreError>;

    // Replaces the stored order with the same id
    async fn save_order(&self, order: &Order) -> Result<(), StoreError>;

    async fn delete_order(&self, id: &str) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct InMemoryDocumentStore {
    products: RwLock<Vec<Product>>,
    reviews: RwLock<Vec<Review>>,
    users: RwLock<Vec<User>>,
    orders: RwLock<Vec<Order>>,
    product_reads: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Simulate an outage of the document store
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    // Product queries served so far; lets tests tell a cache hit from a store read
    pub fn product_reads(&self) -> usize {
        self.product_reads.load(Ordering::SeqCst)
    }

    pub fn seed_product(&self, product: Product) {
        self.products.write().push(product);
    }

    pub fn seed_user(&self, user: User) {
        self.users.write().push(user);
    }

    pub fn seed_order(&self, order: Order) {
        self.orders.write().push(order);
    }

    pub fn seed_review(&self, review: Review) {
        self.reviews.write().push(review);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn product_read(&self) -> Result<(), StoreError> {
        self.check()?;
        self.product_reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn find_products(&self, query: &ProductQuery) -> Result<Vec<Product>, StoreError> {
        self.product_read()?;

        let mut matched: Vec<Product> = self
            .products
            .read()
            .iter()
            .filter(|p| query.filter.matches(p))
            .cloned()
            .collect();

        match query.sort {
            ProductSort::Unsorted => {}
            ProductSort::PriceAsc => matched.sort_by(|a, b| a.price.total_cmp(&b.price)),
            ProductSort::PriceDesc => matched.sort_by(|a, b| b.price.total_cmp(&a.price)),
            ProductSort::NewestFirst => matched.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
        }

        let page = matched
            .into_iter()
            .skip(query.skip)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(page)
    }

    async fn count_products(&self, filter: &ProductFilter) -> Result<u64, StoreError> {
        self.product_read()?;
        Ok(self.products.read().iter().filter(|p| filter.matches(p)).count() as u64)
    }

    async fn distinct_categories(&self) -> Result<Vec<String>, StoreError> {
        self.product_read()?;
        let categories: BTreeSet<String> = self
            .products
            .read()
            .iter()
            .map(|p| p.category.clone())
            .collect();
        Ok(categories.into_iter().collect())
    }

    async fn get_product(&self, id: &str) -> Result<Option<Product>, StoreError> {
        self.product_read()?;
        Ok(self.products.read().iter().find(|p| p.id == id).cloned())
    }

    async fn insert_product(&self, product: Product) -> Result<Product, StoreError> {
        self.check()?;
        self.products.write().push(product.clone());
        Ok(product)
    }

    async fn save_product(&self, product: &Product) -> Result<(), StoreError> {
        self.check()?;
        let mut products = self.products.write();
        match products.iter_mut().find(|p| p.id == product.id) {
            Some(slot) => {
                *slot = product.clone();
                Ok(())
            }
            None => Err(StoreError::Query(format!(
                "no product with id {}",
                product.id
            ))),
        }
    }

    async fn delete_product(&self, id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut products = self.products.write();
        let before = products.len();
        products.retain(|p| p.id != id);
        Ok(products.len() != before)
    }

    async fn find_reviews(&self, product_id: &str) -> Result<Vec<Review>, StoreError> {
        self.check()?;
        let mut reviews: Vec<Review> = self
            .reviews
            .read()
            .iter()
            .filter(|r| r.product_id == product_id)
            .cloned()
            .collect();
        reviews.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(reviews)
    }

    async fn find_review_by_author(
        &self,
        product_id: &str,
        user_id: &str,
    ) -> Result<Option<Review>, StoreError> {
        self.check()?;
        Ok(self
            .reviews
            .read()
            .iter()
            .find(|r| r.product_id == product_id && r.user_id == user_id)
            .cloned())
    }

    async fn get_review(&self, id: &str) -> Result<Option<Review>, StoreError> {
        self.check()?;
        Ok(self.reviews.read().iter().find(|r| r.id == id).cloned())
    }

    async fn save_review(&self, review: &Review) -> Result<(), StoreError> {
        self.check()?;
        let mut reviews = self.reviews.write();
        match reviews.iter_mut().find(|r| r.id == review.id) {
            Some(slot) => *slot = review.clone(),
            None => reviews.push(review.clone()),
        }
        Ok(())
    }

    async fn delete_review(&self, id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut reviews = self.reviews.write();
        let before = reviews.len();
        reviews.retain(|r| r.id != id);
        Ok(reviews.len() != before)
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>, StoreError> {
        self.check()?;
        Ok(self.users.read().iter().find(|u| u.id == id).cloned())
    }

    async fn insert_user(&self, user: User) -> Result<User, StoreError> {
        self.check()?;
        let mut users = self.users.write();
        if users.iter().any(|u| u.id == user.id) {
            return Err(StoreError::Query(format!("duplicate user id {}", user.id)));
        }
        users.push(user.clone());
        Ok(user)
    }

    async fn delete_user(&self, id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut users = self.users.write();
        let before = users.len();
        users.retain(|u| u.id != id);
        Ok(users.len() != before)
    }

    async fn find_users(&self, filter: &UserFilter) -> Result<Vec<User>, StoreError> {
        self.check()?;
        Ok(self
            .users
            .read()
            .iter()
            .filter(|u| filter.matches(u))
            .cloned()
            .collect())
    }

    async fn count_users(&self, filter: &UserFilter) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.users.read().iter().filter(|u| filter.matches(u)).count() as u64)
    }

    async fn find_orders(&self, query: &OrderQuery) -> Result<Vec<Order>, StoreError> {
        self.check()?;
        let mut orders: Vec<Order> = self
            .orders
            .read()
            .iter()
            .filter(|o| query.filter.matches(o))
            .cloned()
            .collect();
        if query.newest_first {
            orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        if let Some(limit) = query.limit {
            orders.truncate(limit);
        }
        Ok(orders)
    }

    async fn count_orders(&self, filter: &OrderFilter) -> Result<u64, StoreError> {
        self.check()?;
        Ok(self.orders.read().iter().filter(|o| filter.matches(o)).count() as u64)
    }

    async fn insert_order(&self, order: Order) -> Result<Order, StoreError> {
        self.check()?;
        self.orders.write().push(order.clone());
        Ok(order)
    }

    async fn get_order(&self, id: &str) -> Result<Option<Order>, StoreError> {
        self.check()?;
        Ok(self.orders.read().iter().find(|o| o.id == id).cloned())
    }

    async fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        self.check()?;
        let mut orders = self.orders.write();
        match orders.iter_mut().find(|o| o.id == order.id) {
            Some(slot) => {
                *slot = order.clone();
                Ok(())
            }
            None => Err(StoreError::Query(format!("no order with id {}", order.id))),
        }
    }

    async fn delete_order(&self, id: &str) -> Result<bool, StoreError> {
        self.check()?;
        let mut orders = self.orders.write();
        let before = orders.len();
        orders.retain(|o| o.id != id);
        Ok(orders.len() != before)
    }
}
