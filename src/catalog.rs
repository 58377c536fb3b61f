// Catalog reads and writes
// Reads go through the read-through cache. Writes validate and authorize first,
// mutate the document store, and only then invalidate, so a concurrent read
// cannot refill a key with pre-mutation data after the purge.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::analytics::{system_clock, Clock};
use crate::codec::{Codec, JsonCodec};
use crate::config::ServiceConfig;
use crate::document_store::{
    new_id, DocumentStore, Photo, Product, ProductFilter, ProductQuery, ProductSort, Review,
    Role,
};
use crate::error::CatalogError;
use crate::invalidation::{InvalidationCoordinator, InvalidationTags};
use crate::keys::{
    build_listing_key, product_key, reviews_key, ListingFilter, SortDirection, ALL_PRODUCTS_KEY,
    CATEGORIES_KEY, LATEST_PRODUCTS_KEY,
};
use crate::ratings::recompute_ratings;
use crate::read_through::{CacheContext, Expiry, FillPolicy, ReadThroughCache};
use crate::users::require_registered;

const LATEST_PRODUCTS_LIMIT: usize = 5;
const MAX_PHOTOS: usize = 5;

// Already-authenticated caller of a request
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

impl Actor {
    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Admin,
        }
    }

    pub fn customer(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::User,
        }
    }

    pub fn require_admin(&self) -> Result<(), CatalogError> {
        match self.role {
            Role::Admin => Ok(()),
            Role::User => Err(CatalogError::Unauthorized(format!(
                "user {} is not an admin",
                self.user_id
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewProduct {
    pub name: String,
    pub price: f64,
    pub stock: u32,
    pub category: String,
    pub description: String,
    pub photos: Vec<Photo>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductUpdate {
    pub name: Option<String>,
    pub price: Option<f64>,
    pub stock: Option<u32>,
    pub category: Option<String>,
    pub description: Option<String>,
    // Replaces every existing photo when present
    pub photos: Option<Vec<Photo>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductPage {
    pub products: Vec<Product>,
    pub total_pages: u32,
}

// Result of a product update or delete; the removed photos still have to be
// dropped from the object store by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct ProductChange {
    pub product: Product,
    pub removed_photo_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewOutcome {
    Created,
    Updated,
}

pub struct CatalogService<C: Codec = JsonCodec> {
    store: Arc<dyn DocumentStore>,
    cache: Arc<ReadThroughCache<C>>,
    coordinator: Arc<InvalidationCoordinator>,
    config: ServiceConfig,
    clock: Clock,
}

impl<C: Codec> CatalogService<C> {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        context: &CacheContext<C>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            cache: context.cache(),
            coordinator: context.coordinator(),
            config,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    // Five newest products
    pub async fn latest_products(&self) -> Result<Vec<Product>, CatalogError> {
        let store = Arc::clone(&self.store);
        self.cache
            .fetch(
                LATEST_PRODUCTS_KEY,
                FillPolicy::ReadThrough(Expiry::Ttl),
                move || load_latest(store),
            )
            .await
    }

    pub async fn categories(&self) -> Result<Vec<String>, CatalogError> {
        let store = Arc::clone(&self.store);
        self.cache
            .fetch(
                CATEGORIES_KEY,
                FillPolicy::ReadThrough(Expiry::Ttl),
                move || load_categories(store),
            )
            .await
    }

    // Kept without expiry; only a product invalidation refreshes it
    pub async fn admin_products(&self, actor: &Actor) -> Result<Vec<Product>, CatalogError> {
        actor.require_admin()?;
        let store = Arc::clone(&self.store);
        self.cache
            .fetch(
                ALL_PRODUCTS_KEY,
                FillPolicy::ReadThrough(Expiry::Never),
                move || load_all_products(store),
            )
            .await
    }

    pub async fn product(&self, id: &str) -> Result<Product, CatalogError> {
        let store = Arc::clone(&self.store);
        let id = id.to_string();
        self.cache
            .fetch(
                &product_key(&id),
                FillPolicy::ReadThrough(Expiry::Ttl),
                move || load_product(store, id),
            )
            .await
    }

    pub async fn listing(&self, filter: &ListingFilter) -> Result<ProductPage, CatalogError> {
        let filter = filter.normalized();
        let key = build_listing_key(&filter);
        let store = Arc::clone(&self.store);
        let page_size = self.config.page_size;
        self.cache
            .fetch(&key, FillPolicy::Listing, move || {
                load_listing(store, filter, page_size)
            })
            .await
    }

    pub async fn reviews(&self, product_id: &str) -> Result<Vec<Review>, CatalogError> {
        let store = Arc::clone(&self.store);
        let product_id = product_id.to_string();
        self.cache
            .fetch(
                &reviews_key(&product_id),
                FillPolicy::ReadThrough(Expiry::Ttl),
                move || load_reviews(store, product_id),
            )
            .await
    }

    pub async fn create_product(
        &self,
        actor: &Actor,
        new_product: NewProduct,
    ) -> Result<Product, CatalogError> {
        actor.require_admin()?;
        validate_new_product(&new_product)?;

        let product = Product {
            id: new_id(),
            name: new_product.name,
            price: new_product.price,
            stock: new_product.stock,
            category: new_product.category.to_lowercase(),
            description: new_product.description,
            photos: new_product.photos,
            ratings: 0,
            num_of_reviews: 0,
            created_at: (self.clock)(),
        };
        let product = self.store.insert_product(product).await?;
        info!(product_id = %product.id, "product created");

        self.invalidate(InvalidationTags::new().product().admin())
            .await?;
        Ok(product)
    }

    pub async fn update_product(
        &self,
        actor: &Actor,
        id: &str,
        update: ProductUpdate,
    ) -> Result<ProductChange, CatalogError> {
        actor.require_admin()?;
        validate_update(&update)?;

        let mut product = self
            .store
            .get_product(id)
            .await?
            .ok_or_else(|| not_found_product(id))?;

        let mut removed_photo_ids = Vec::new();
        if let Some(photos) = update.photos {
            removed_photo_ids = product.photos.iter().map(|p| p.public_id.clone()).collect();
            product.photos = photos;
        }
        if let Some(name) = update.name {
            product.name = name;
        }
        if let Some(price) = update.price {
            product.price = price;
        }
        if let Some(stock) = update.stock {
            product.stock = stock;
        }
        if let Some(category) = update.category {
            product.category = category.to_lowercase();
        }
        if let Some(description) = update.description {
            product.description = description;
        }

        self.store.save_product(&product).await?;
        info!(product_id = %product.id, "product updated");

        self.invalidate(
            InvalidationTags::new()
                .product()
                .admin()
                .product_id(product.id.clone()),
        )
        .await?;

        Ok(ProductChange {
            product,
            removed_photo_ids,
        })
    }

    pub async fn delete_product(
        &self,
        actor: &Actor,
        id: &str,
    ) -> Result<ProductChange, CatalogError> {
        actor.require_admin()?;

        let product = self
            .store
            .get_product(id)
            .await?
            .ok_or_else(|| not_found_product(id))?;
        self.store.delete_product(id).await?;
        info!(product_id = %id, "product deleted");

        self.invalidate(
            InvalidationTags::new()
                .product()
                .admin()
                .product_id(id),
        )
        .await?;

        let removed_photo_ids = product.photos.iter().map(|p| p.public_id.clone()).collect();
        Ok(ProductChange {
            product,
            removed_photo_ids,
        })
    }

    /// Creates the actor's review of a product, or updates it if one exists,
    /// then recomputes the product's rating summary from all of its reviews.
    pub async fn upsert_review(
        &self,
        actor: &Actor,
        product_id: &str,
        rating: u8,
        comment: &str,
    ) -> Result<ReviewOutcome, CatalogError> {
        validate_rating(rating)?;
        require_registered(self.store.as_ref(), actor).await?;

        let product = self
            .store
            .get_product(product_id)
            .await?
            .ok_or_else(|| not_found_product(product_id))?;

        let now = (self.clock)();
        let existing = self
            .store
            .find_review_by_author(&product.id, &actor.user_id)
            .await?;
        let (review, outcome) = match existing {
            Some(mut review) => {
                review.rating = rating;
                review.comment = comment.to_string();
                review.updated_at = now;
                (review, ReviewOutcome::Updated)
            }
            None => (
                Review {
                    id: new_id(),
                    product_id: product.id.clone(),
                    user_id: actor.user_id.clone(),
                    rating,
                    comment: comment.to_string(),
                    updated_at: now,
                },
                ReviewOutcome::Created,
            ),
        };
        self.store.save_review(&review).await?;

        self.refresh_ratings(product).await?;
        debug!(product_id, review_id = %review.id, ?outcome, "review saved");
        Ok(outcome)
    }

    // Only the author may delete a review
    pub async fn delete_review(&self, actor: &Actor, review_id: &str) -> Result<(), CatalogError> {
        require_registered(self.store.as_ref(), actor).await?;

        let review = self
            .store
            .get_review(review_id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("review {}", review_id)))?;

        if review.user_id != actor.user_id {
            return Err(CatalogError::Unauthorized(format!(
                "review {} belongs to another user",
                review_id
            )));
        }

        self.store.delete_review(review_id).await?;

        let product = self
            .store
            .get_product(&review.product_id)
            .await?
            .ok_or_else(|| not_found_product(&review.product_id))?;
        self.refresh_ratings(product).await?;
        debug!(review_id, "review deleted");
        Ok(())
    }

    async fn refresh_ratings(&self, mut product: Product) -> Result<(), CatalogError> {
        let reviews = self.store.find_reviews(&product.id).await?;
        let summary = recompute_ratings(reviews.iter().map(|r| r.rating));
        product.ratings = summary.average;
        product.num_of_reviews = summary.count;
        self.store.save_product(&product).await?;

        self.invalidate(
            InvalidationTags::new()
                .product()
                .admin()
                .review()
                .product_id(product.id.clone()),
        )
        .await
    }

    async fn invalidate(&self, tags: InvalidationTags) -> Result<(), CatalogError> {
        self.coordinator.invalidate(&tags).await?;
        Ok(())
    }
}

async fn load_latest(store: Arc<dyn DocumentStore>) -> Result<Vec<Product>, CatalogError> {
    let query = ProductQuery {
        sort: ProductSort::NewestFirst,
        limit: Some(LATEST_PRODUCTS_LIMIT),
        ..Default::default()
    };
    Ok(store.find_products(&query).await?)
}

async fn load_categories(store: Arc<dyn DocumentStore>) -> Result<Vec<String>, CatalogError> {
    Ok(store.distinct_categories().await?)
}

async fn load_all_products(store: Arc<dyn DocumentStore>) -> Result<Vec<Product>, CatalogError> {
    Ok(store.find_products(&ProductQuery::default()).await?)
}

async fn load_product(store: Arc<dyn DocumentStore>, id: String) -> Result<Product, CatalogError> {
    store
        .get_product(&id)
        .await?
        .ok_or_else(|| not_found_product(&id))
}

async fn load_reviews(
    store: Arc<dyn DocumentStore>,
    product_id: String,
) -> Result<Vec<Review>, CatalogError> {
    Ok(store.find_reviews(&product_id).await?)
}

async fn load_listing(
    store: Arc<dyn DocumentStore>,
    filter: ListingFilter,
    page_size: u32,
) -> Result<ProductPage, CatalogError> {
    let product_filter = ProductFilter {
        name_contains: filter.search.clone(),
        category: filter.category.clone(),
        max_price: filter.max_price,
        ..Default::default()
    };
    let query = ProductQuery {
        filter: product_filter.clone(),
        sort: match filter.sort {
            Some(SortDirection::Asc) => ProductSort::PriceAsc,
            Some(SortDirection::Desc) => ProductSort::PriceDesc,
            None => ProductSort::Unsorted,
        },
        skip: (filter.page.max(1) as usize - 1) * page_size as usize,
        limit: Some(page_size as usize),
    };

    let (products, filtered) = futures::try_join!(
        store.find_products(&query),
        store.count_products(&product_filter)
    )?;

    Ok(ProductPage {
        products,
        total_pages: filtered.div_ceil(page_size as u64) as u32,
    })
}

pub(crate) fn not_found_product(id: &str) -> CatalogError {
    CatalogError::NotFound(format!("product {}", id))
}

fn validate_photos(photos: &[Photo]) -> Result<(), CatalogError> {
    if photos.is_empty() {
        return Err(CatalogError::Validation(
            "at least one photo is required".to_string(),
        ));
    }
    if photos.len() > MAX_PHOTOS {
        return Err(CatalogError::Validation(format!(
            "at most {} photos are allowed",
            MAX_PHOTOS
        )));
    }
    Ok(())
}

fn validate_price(price: f64) -> Result<(), CatalogError> {
    if !price.is_finite() || price <= 0.0 {
        return Err(CatalogError::Validation(format!(
            "price must be a positive amount, got {}",
            price
        )));
    }
    Ok(())
}

fn validate_new_product(product: &NewProduct) -> Result<(), CatalogError> {
    validate_photos(&product.photos)?;
    for (field, value) in [
        ("name", &product.name),
        ("category", &product.category),
        ("description", &product.description),
    ] {
        if value.trim().is_empty() {
            return Err(CatalogError::Validation(format!("{} is required", field)));
        }
    }
    validate_price(product.price)
}

fn validate_update(update: &ProductUpdate) -> Result<(), CatalogError> {
    if let Some(photos) = &update.photos {
        validate_photos(photos)?;
    }
    if let Some(price) = update.price {
        validate_price(price)?;
    }
    for (field, value) in [
        ("name", &update.name),
        ("category", &update.category),
        ("description", &update.description),
    ] {
        if matches!(value, Some(v) if v.trim().is_empty()) {
            return Err(CatalogError::Validation(format!("{} cannot be blank", field)));
        }
    }
    Ok(())
}

fn validate_rating(rating: u8) -> Result<(), CatalogError> {
    if !(1..=5).contains(&rating) {
        return Err(CatalogError::Validation(format!(
            "rating must be between 1 and 5, got {}",
            rating
        )));
    }
    Ok(())
}
