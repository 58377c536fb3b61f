// Main library file for the storefront cache and analytics core

// Collaborators
pub mod document_store;
pub mod kv_store;

// Caching
pub mod codec;
pub mod invalidation;
pub mod keys;
pub mod read_through;
pub mod single_flight;

// Analytics
pub mod analytics;
pub mod ratings;

// Services
pub mod catalog;
pub mod dashboard;
pub mod orders;
pub mod users;

pub mod config;
pub mod error;

// Re-export key types for convenience
pub use analytics::{percent_change, Clock, DateRange, TimeWindow, Timestamped};
pub use catalog::{Actor, CatalogService, NewProduct, ProductPage, ProductUpdate};
pub use codec::{Codec, JsonCodec};
pub use config::{ConfigError, ServiceConfig};
pub use dashboard::{BarCharts, DashboardService, DashboardStats, LineCharts, PieCharts};
pub use document_store::{DocumentStore, InMemoryDocumentStore, StoreError};
pub use error::CatalogError;
pub use invalidation::{InvalidationCoordinator, InvalidationTags};
pub use keys::{build_listing_key, ListingFilter, SortDirection};
pub use kv_store::{InMemoryKvStore, KeyValueStore, KvError, KvStatsReport, TimeoutStore};
pub use orders::{NewOrder, OrderService};
pub use ratings::{recompute_ratings, RatingSummary};
pub use read_through::{CacheContext, Expiry, FillPolicy, ReadThroughCache};
pub use users::{NewUser, Registration, UserService};
