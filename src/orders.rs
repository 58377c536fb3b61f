// Order placement and fulfillment
// Order reads are cached per user, per order, and for the admin list. Every
// order write purges those keys together with the dashboard.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::analytics::{system_clock, Clock};
use crate::catalog::{not_found_product, Actor};
use crate::codec::{Codec, JsonCodec};
use crate::document_store::{
    new_id, DocumentStore, Order, OrderFilter, OrderItem, OrderQuery, OrderStatus, Product, Role,
};
use crate::error::CatalogError;
use crate::invalidation::{InvalidationCoordinator, InvalidationTags};
use crate::keys::{my_orders_key, order_key, ALL_ORDERS_KEY};
use crate::read_through::{CacheContext, Expiry, FillPolicy, ReadThroughCache};

#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub items: Vec<OrderItem>,
    pub subtotal: f64,
    pub tax: f64,
    pub shipping_charges: f64,
    pub discount: f64,
    pub total: f64,
}

pub struct OrderService<C: Codec = JsonCodec> {
    store: Arc<dyn DocumentStore>,
    cache: Arc<ReadThroughCache<C>>,
    coordinator: Arc<InvalidationCoordinator>,
    clock: Clock,
}

impl<C: Codec> OrderService<C> {
    pub fn new(store: Arc<dyn DocumentStore>, context: &CacheContext<C>) -> Self {
        Self {
            store,
            cache: context.cache(),
            coordinator: context.coordinator(),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    // The actor's own orders, newest first
    pub async fn my_orders(&self, actor: &Actor) -> Result<Vec<Order>, CatalogError> {
        let store = Arc::clone(&self.store);
        let user_id = actor.user_id.clone();
        self.cache
            .fetch(
                &my_orders_key(&user_id),
                FillPolicy::ReadThrough(Expiry::Ttl),
                move || load_orders(store, Some(user_id)),
            )
            .await
    }

    pub async fn all_orders(&self, actor: &Actor) -> Result<Vec<Order>, CatalogError> {
        actor.require_admin()?;
        let store = Arc::clone(&self.store);
        self.cache
            .fetch(
                ALL_ORDERS_KEY,
                FillPolicy::ReadThrough(Expiry::Ttl),
                move || load_orders(store, None),
            )
            .await
    }

    /// Loads one order. Customers may only read their own orders; the cached
    /// entry is shared, so ownership is checked after the fetch.
    pub async fn order(&self, actor: &Actor, id: &str) -> Result<Order, CatalogError> {
        let store = Arc::clone(&self.store);
        let order_id = id.to_string();
        let order: Order = self
            .cache
            .fetch(
                &order_key(id),
                FillPolicy::ReadThrough(Expiry::Ttl),
                move || load_order(store, order_id),
            )
            .await?;

        if actor.role != Role::Admin && order.user_id != actor.user_id {
            return Err(CatalogError::Unauthorized(format!(
                "order {} belongs to another user",
                id
            )));
        }
        Ok(order)
    }

    /// Stores a new order for the actor and takes its quantities out of stock.
    /// Lines that repeat a product are checked and deducted as one combined
    /// quantity, and every product is saved once.
    pub async fn place_order(
        &self,
        actor: &Actor,
        new_order: NewOrder,
    ) -> Result<Order, CatalogError> {
        validate_order(&new_order)?;

        let mut quantities: BTreeMap<&str, u32> = BTreeMap::new();
        for item in &new_order.items {
            let combined = quantities.entry(item.product_id.as_str()).or_insert(0);
            *combined = combined.checked_add(item.quantity).ok_or_else(|| {
                CatalogError::Validation(format!(
                    "quantity of product {} is too large",
                    item.product_id
                ))
            })?;
        }

        // Every product is checked before the first write
        let mut updated: Vec<Product> = Vec::with_capacity(quantities.len());
        for (&product_id, &quantity) in &quantities {
            let mut product = self
                .store
                .get_product(product_id)
                .await?
                .ok_or_else(|| not_found_product(product_id))?;
            if quantity > product.stock {
                return Err(CatalogError::Validation(format!(
                    "only {} of product {} in stock, {} ordered",
                    product.stock, product_id, quantity
                )));
            }
            product.stock -= quantity;
            updated.push(product);
        }

        for product in &updated {
            self.store.save_product(product).await?;
        }

        let order = Order {
            id: new_id(),
            user_id: actor.user_id.clone(),
            items: new_order.items,
            subtotal: new_order.subtotal,
            tax: new_order.tax,
            shipping_charges: new_order.shipping_charges,
            discount: new_order.discount,
            total: new_order.total,
            status: OrderStatus::Processing,
            created_at: (self.clock)(),
        };
        let order = self.store.insert_order(order).await?;
        info!(order_id = %order.id, user_id = %order.user_id, "order placed");

        self.invalidate(
            InvalidationTags::new()
                .product()
                .order()
                .admin()
                .product_ids(updated.iter().map(|p| p.id.clone()))
                .order_id(order.id.clone())
                .user_id(order.user_id.clone()),
        )
        .await?;
        Ok(order)
    }

    // Moves the order one fulfillment step forward
    pub async fn process_order(&self, actor: &Actor, id: &str) -> Result<Order, CatalogError> {
        actor.require_admin()?;

        let mut order = self.stored_order(id).await?;
        order.status = order.status.advance();
        self.store.save_order(&order).await?;
        info!(order_id = %order.id, status = ?order.status, "order processed");

        self.invalidate_order(&order).await?;
        Ok(order)
    }

    pub async fn delete_order(&self, actor: &Actor, id: &str) -> Result<Order, CatalogError> {
        actor.require_admin()?;

        let order = self.stored_order(id).await?;
        self.store.delete_order(id).await?;
        info!(order_id = %id, "order deleted");

        self.invalidate_order(&order).await?;
        Ok(order)
    }

    async fn stored_order(&self, id: &str) -> Result<Order, CatalogError> {
        self.store
            .get_order(id)
            .await?
            .ok_or_else(|| not_found_order(id))
    }

    async fn invalidate_order(&self, order: &Order) -> Result<(), CatalogError> {
        self.invalidate(
            InvalidationTags::new()
                .order()
                .admin()
                .order_id(order.id.clone())
                .user_id(order.user_id.clone()),
        )
        .await
    }

    async fn invalidate(&self, tags: InvalidationTags) -> Result<(), CatalogError> {
        self.coordinator.invalidate(&tags).await?;
        Ok(())
    }
}

async fn load_orders(
    store: Arc<dyn DocumentStore>,
    user_id: Option<String>,
) -> Result<Vec<Order>, CatalogError> {
    let query = OrderQuery {
        filter: OrderFilter {
            user_id,
            ..Default::default()
        },
        newest_first: true,
        limit: None,
    };
    Ok(store.find_orders(&query).await?)
}

async fn load_order(store: Arc<dyn DocumentStore>, id: String) -> Result<Order, CatalogError> {
    store
        .get_order(&id)
        .await?
        .ok_or_else(|| not_found_order(&id))
}

fn not_found_order(id: &str) -> CatalogError {
    CatalogError::NotFound(format!("order {}", id))
}

fn validate_order(order: &NewOrder) -> Result<(), CatalogError> {
    if order.items.is_empty() {
        return Err(CatalogError::Validation(
            "an order needs at least one item".to_string(),
        ));
    }
    if let Some(item) = order.items.iter().find(|i| i.quantity == 0) {
        return Err(CatalogError::Validation(format!(
            "quantity of product {} must be positive",
            item.product_id
        )));
    }
    for (field, amount) in [
        ("subtotal", order.subtotal),
        ("tax", order.tax),
        ("shipping charges", order.shipping_charges),
        ("discount", order.discount),
        ("total", order.total),
    ] {
        if !amount.is_finite() || amount < 0.0 {
            return Err(CatalogError::Validation(format!(
                "{} must be a non-negative amount, got {}",
                field, amount
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::keys::{product_key, ADMIN_STATS_KEY};
    use crate::kv_store::InMemoryKvStore;
    use crate::document_store::InMemoryDocumentStore;
    use crate::{CatalogService, DashboardService, NewProduct};
    use crate::document_store::Photo;

    struct Harness {
        kv: Arc<InMemoryKvStore>,
        store: Arc<InMemoryDocumentStore>,
        catalog: CatalogService,
        orders: OrderService,
        dashboard: DashboardService,
    }

    async fn harness() -> Harness {
        let kv = Arc::new(InMemoryKvStore::new());
        let store = Arc::new(InMemoryDocumentStore::new());
        let config = ServiceConfig::default();
        let context = CacheContext::connect(kv.clone(), &config).await.unwrap();
        Harness {
            kv,
            catalog: CatalogService::new(store.clone(), &context, config),
            orders: OrderService::new(store.clone(), &context),
            dashboard: DashboardService::new(store.clone(), &context),
            store,
        }
    }

    async fn stocked(h: &Harness, stock: u32) -> Product {
        let new_product = NewProduct {
            name: "Desk Lamp".to_string(),
            price: 40.0,
            stock,
            category: "home".to_string(),
            description: "Warm light".to_string(),
            photos: vec![Photo {
                url: "https://img.example/lamp.jpg".to_string(),
                public_id: "lamp".to_string(),
            }],
        };
        h.catalog
            .create_product(&Actor::admin("admin-1"), new_product)
            .await
            .unwrap()
    }

    fn line(product_id: &str, quantity: u32) -> OrderItem {
        OrderItem {
            product_id: product_id.to_string(),
            name: "Desk Lamp".to_string(),
            price: 40.0,
            quantity,
        }
    }

    fn new_order(items: Vec<OrderItem>) -> NewOrder {
        let subtotal = items.iter().map(|i| i.price * i.quantity as f64).sum::<f64>();
        NewOrder {
            items,
            subtotal,
            tax: 0.0,
            shipping_charges: 0.0,
            discount: 0.0,
            total: subtotal,
        }
    }

    #[tokio::test]
    async fn test_place_order_decrements_stock_and_purges_product() {
        let h = harness().await;
        let product = stocked(&h, 10).await;
        h.catalog.product(&product.id).await.unwrap();
        assert!(h.kv.contains_key(&product_key(&product.id)));

        let alice = Actor::customer("alice");
        let order = h
            .orders
            .place_order(&alice, new_order(vec![line(&product.id, 3)]))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(order.user_id, "alice");

        assert!(!h.kv.contains_key(&product_key(&product.id)));
        assert_eq!(h.catalog.product(&product.id).await.unwrap().stock, 7);
    }

    #[tokio::test]
    async fn test_repeated_product_lines_are_deducted_together() {
        let h = harness().await;
        let product = stocked(&h, 10).await;
        let alice = Actor::customer("alice");

        h.orders
            .place_order(
                &alice,
                new_order(vec![line(&product.id, 2), line(&product.id, 3)]),
            )
            .await
            .unwrap();
        let stored = h.store.get_product(&product.id).await.unwrap().unwrap();
        assert_eq!(stored.stock, 5);

        // each line fits on its own, together they do not
        let result = h
            .orders
            .place_order(
                &alice,
                new_order(vec![line(&product.id, 3), line(&product.id, 3)]),
            )
            .await;
        assert!(matches!(result, Err(CatalogError::Validation(_))));
        let stored = h.store.get_product(&product.id).await.unwrap().unwrap();
        assert_eq!(stored.stock, 5);
        assert_eq!(h.orders.my_orders(&alice).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_combined_quantity_above_stock_is_rejected() {
        let h = harness().await;
        let product = stocked(&h, 7).await;

        let result = h
            .orders
            .place_order(
                &Actor::customer("alice"),
                new_order(vec![line(&product.id, 6), line(&product.id, 6)]),
            )
            .await;
        assert!(matches!(result, Err(CatalogError::Validation(_))));
        let stored = h.store.get_product(&product.id).await.unwrap().unwrap();
        assert_eq!(stored.stock, 7);
    }

    #[tokio::test]
    async fn test_failed_stock_check_writes_nothing() {
        let h = harness().await;
        let plenty = stocked(&h, 10).await;
        let scarce = stocked(&h, 1).await;

        let result = h
            .orders
            .place_order(
                &Actor::customer("alice"),
                new_order(vec![line(&plenty.id, 4), line(&scarce.id, 2)]),
            )
            .await;
        assert!(matches!(result, Err(CatalogError::Validation(_))));
        let stored = h.store.get_product(&plenty.id).await.unwrap().unwrap();
        assert_eq!(stored.stock, 10);
        assert!(h.orders.all_orders(&Actor::admin("root")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_order_validation() {
        let h = harness().await;
        let alice = Actor::customer("alice");

        let empty = h.orders.place_order(&alice, new_order(vec![])).await;
        assert!(matches!(empty, Err(CatalogError::Validation(_))));

        let zero = h.orders.place_order(&alice, new_order(vec![line("p1", 0)])).await;
        assert!(matches!(zero, Err(CatalogError::Validation(_))));

        let mut negative = new_order(vec![line("p1", 1)]);
        negative.discount = -5.0;
        let negative = h.orders.place_order(&alice, negative).await;
        assert!(matches!(negative, Err(CatalogError::Validation(_))));

        let missing = h.orders.place_order(&alice, new_order(vec![line("p1", 1)])).await;
        assert!(matches!(missing, Err(CatalogError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_my_orders_are_cached_until_the_next_order() {
        let h = harness().await;
        let product = stocked(&h, 10).await;
        let alice = Actor::customer("alice");
        let bob = Actor::customer("bob");

        h.orders
            .place_order(&alice, new_order(vec![line(&product.id, 1)]))
            .await
            .unwrap();
        assert_eq!(h.orders.my_orders(&alice).await.unwrap().len(), 1);
        assert!(h.kv.contains_key(&my_orders_key("alice")));
        assert!(h.orders.my_orders(&bob).await.unwrap().is_empty());

        h.orders
            .place_order(&alice, new_order(vec![line(&product.id, 1)]))
            .await
            .unwrap();
        assert!(!h.kv.contains_key(&my_orders_key("alice")));
        // bob placed nothing, his list stays cached
        assert!(h.kv.contains_key(&my_orders_key("bob")));
        assert_eq!(h.orders.my_orders(&alice).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_order_read_is_limited_to_owner_and_admin() {
        let h = harness().await;
        let product = stocked(&h, 10).await;
        let order = h
            .orders
            .place_order(&Actor::customer("alice"), new_order(vec![line(&product.id, 1)]))
            .await
            .unwrap();

        let own = h.orders.order(&Actor::customer("alice"), &order.id).await.unwrap();
        assert_eq!(own.id, order.id);
        assert!(h.kv.contains_key(&order_key(&order.id)));

        let other = h.orders.order(&Actor::customer("bob"), &order.id).await;
        assert!(matches!(other, Err(CatalogError::Unauthorized(_))));
        assert!(h.orders.order(&Actor::admin("root"), &order.id).await.is_ok());

        let missing = h.orders.order(&Actor::admin("root"), "nope").await;
        assert!(matches!(missing, Err(CatalogError::NotFound(_))));
        assert!(!h.kv.contains_key(&order_key("nope")));
    }

    #[tokio::test]
    async fn test_process_order_advances_status_and_purges_keys() {
        let h = harness().await;
        let admin = Actor::admin("root");
        let alice = Actor::customer("alice");
        let product = stocked(&h, 10).await;
        let order = h
            .orders
            .place_order(&alice, new_order(vec![line(&product.id, 1)]))
            .await
            .unwrap();

        h.orders.order(&alice, &order.id).await.unwrap();
        h.orders.all_orders(&admin).await.unwrap();
        h.dashboard.stats(&admin).await.unwrap();

        let denied = h.orders.process_order(&alice, &order.id).await;
        assert!(matches!(denied, Err(CatalogError::Unauthorized(_))));

        let shipped = h.orders.process_order(&admin, &order.id).await.unwrap();
        assert_eq!(shipped.status, OrderStatus::Shipped);
        for key in [order_key(&order.id), ALL_ORDERS_KEY.to_string(), ADMIN_STATS_KEY.to_string()] {
            assert!(!h.kv.contains_key(&key), "{} should be purged", key);
        }
        assert_eq!(
            h.orders.order(&alice, &order.id).await.unwrap().status,
            OrderStatus::Shipped
        );

        h.orders.process_order(&admin, &order.id).await.unwrap();
        let delivered = h.orders.process_order(&admin, &order.id).await.unwrap();
        assert_eq!(delivered.status, OrderStatus::Delivered);
    }

    #[tokio::test]
    async fn test_delete_order() {
        let h = harness().await;
        let admin = Actor::admin("root");
        let alice = Actor::customer("alice");
        let product = stocked(&h, 10).await;
        let order = h
            .orders
            .place_order(&alice, new_order(vec![line(&product.id, 1)]))
            .await
            .unwrap();
        assert_eq!(h.orders.my_orders(&alice).await.unwrap().len(), 1);

        let denied = h.orders.delete_order(&alice, &order.id).await;
        assert!(matches!(denied, Err(CatalogError::Unauthorized(_))));

        h.orders.delete_order(&admin, &order.id).await.unwrap();
        assert!(!h.kv.contains_key(&my_orders_key("alice")));
        assert!(h.orders.my_orders(&alice).await.unwrap().is_empty());

        let again = h.orders.delete_order(&admin, &order.id).await;
        assert!(matches!(again, Err(CatalogError::NotFound(_))));
    }
}
