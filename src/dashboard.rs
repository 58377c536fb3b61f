// Admin dashboard
// Statistics are read through the cache. The pie, bar and line charts are
// recomputed on every call and only written back, so they always reflect the
// current store even though order and product writes purge them anyway.

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::analytics::{
    category_share, count_by_month, last_month, percent_change, sum_by_month, system_clock,
    this_month, Clock, DateRange, TimeWindow,
};
use crate::catalog::Actor;
use crate::codec::{Codec, JsonCodec};
use crate::document_store::{
    DocumentStore, Gender, Order, OrderFilter, OrderQuery, OrderStatus, ProductFilter,
    ProductQuery, Role, UserFilter,
};
use crate::error::CatalogError;
use crate::keys::{ADMIN_BAR_CHARTS_KEY, ADMIN_LINE_CHARTS_KEY, ADMIN_PIE_CHARTS_KEY, ADMIN_STATS_KEY};
use crate::read_through::{CacheContext, Expiry, FillPolicy, ReadThroughCache};

const LATEST_TRANSACTIONS: usize = 4;
// Share of gross income booked as marketing cost
const MARKETING_RATE: f64 = 0.30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryShare {
    pub category: String,
    // Whole percent of all products
    pub percent: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePercent {
    pub revenue: f64,
    pub product: f64,
    pub user: f64,
    pub order: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub revenue: f64,
    pub product: u64,
    pub user: u64,
    pub order: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyOrders {
    pub orders: Vec<u64>,
    pub revenue: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRatio {
    pub male: u64,
    pub female: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub discount: f64,
    pub amount: f64,
    // Number of order lines
    pub quantity: usize,
    pub status: OrderStatus,
}

impl From<&Order> for Transaction {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id.clone(),
            discount: order.discount,
            amount: order.total,
            quantity: order.items.len(),
            status: order.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardStats {
    pub category_count: Vec<CategoryShare>,
    pub change_percent: ChangePercent,
    pub count: Totals,
    // Last six months, oldest first
    pub chart: MonthlyOrders,
    pub user_ratio: UserRatio,
    pub latest_transactions: Vec<Transaction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFulfillment {
    pub processing: u64,
    pub shipped: u64,
    pub delivered: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAvailability {
    pub in_stock: u64,
    pub out_of_stock: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueDistribution {
    pub net_margin: f64,
    pub discount: f64,
    pub production_cost: f64,
    pub burnt: f64,
    pub marketing_cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminCustomer {
    pub admin: u64,
    pub customer: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgeGroups {
    // Under 20
    pub teen: u64,
    // 20 to 39
    pub adult: u64,
    // 40 and over
    pub old: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieCharts {
    pub order_fulfillment: OrderFulfillment,
    pub product_categories: Vec<CategoryShare>,
    pub stock_availability: StockAvailability,
    pub revenue_distribution: RevenueDistribution,
    pub admin_customer: AdminCustomer,
    pub user_age_groups: UserAgeGroups,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarCharts {
    // Six months
    pub products: Vec<u64>,
    // Six months
    pub users: Vec<u64>,
    // Twelve months
    pub orders: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineCharts {
    pub products: Vec<u64>,
    pub users: Vec<u64>,
    pub discount: Vec<f64>,
    pub revenue: Vec<f64>,
}

pub struct DashboardService<C: Codec = JsonCodec> {
    store: Arc<dyn DocumentStore>,
    cache: Arc<ReadThroughCache<C>>,
    clock: Clock,
}

impl<C: Codec> DashboardService<C> {
    pub fn new(store: Arc<dyn DocumentStore>, context: &CacheContext<C>) -> Self {
        Self {
            store,
            cache: context.cache(),
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn stats(&self, actor: &Actor) -> Result<DashboardStats, CatalogError> {
        actor.require_admin()?;
        let store = Arc::clone(&self.store);
        let now = (self.clock)();
        self.cache
            .fetch(
                ADMIN_STATS_KEY,
                FillPolicy::ReadThrough(Expiry::Ttl),
                move || load_stats(store, now),
            )
            .await
    }

    pub async fn pie_charts(&self, actor: &Actor) -> Result<PieCharts, CatalogError> {
        actor.require_admin()?;
        let store = Arc::clone(&self.store);
        let now = (self.clock)();
        self.cache
            .fetch(ADMIN_PIE_CHARTS_KEY, FillPolicy::Refresh(Expiry::Ttl), move || {
                load_pie_charts(store, now)
            })
            .await
    }

    pub async fn bar_charts(&self, actor: &Actor) -> Result<BarCharts, CatalogError> {
        actor.require_admin()?;
        let store = Arc::clone(&self.store);
        let now = (self.clock)();
        self.cache
            .fetch(ADMIN_BAR_CHARTS_KEY, FillPolicy::Refresh(Expiry::Ttl), move || {
                load_bar_charts(store, now)
            })
            .await
    }

    pub async fn line_charts(&self, actor: &Actor) -> Result<LineCharts, CatalogError> {
        actor.require_admin()?;
        let store = Arc::clone(&self.store);
        let now = (self.clock)();
        self.cache
            .fetch(ADMIN_LINE_CHARTS_KEY, FillPolicy::Refresh(Expiry::Ttl), move || {
                load_line_charts(store, now)
            })
            .await
    }
}

fn products_created(range: DateRange) -> ProductQuery {
    ProductQuery {
        filter: ProductFilter {
            created: Some(range),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn users_created(range: DateRange) -> UserFilter {
    UserFilter {
        created: Some(range),
        ..Default::default()
    }
}

fn orders_created(range: DateRange) -> OrderQuery {
    OrderQuery {
        filter: OrderFilter {
            created: Some(range),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn order_status(status: OrderStatus) -> OrderFilter {
    OrderFilter {
        status: Some(status),
        ..Default::default()
    }
}

fn user_role(role: Role) -> UserFilter {
    UserFilter {
        role: Some(role),
        ..Default::default()
    }
}

fn total_revenue(orders: &[Order]) -> f64 {
    orders.iter().map(|o| o.total).sum()
}

async fn category_shares(
    store: &Arc<dyn DocumentStore>,
    product_total: u64,
) -> Result<Vec<CategoryShare>, CatalogError> {
    let categories = store.distinct_categories().await?;
    let counts = try_join_all(categories.iter().map(|category| {
        let filter = ProductFilter {
            category: Some(category.clone()),
            ..Default::default()
        };
        async move { store.count_products(&filter).await }
    }))
    .await?;

    Ok(categories
        .into_iter()
        .zip(counts)
        .map(|(category, count)| CategoryShare {
            category,
            percent: category_share(count, product_total),
        })
        .collect())
}

async fn load_stats(
    store: Arc<dyn DocumentStore>,
    now: DateTime<Utc>,
) -> Result<DashboardStats, CatalogError> {
    let current = this_month(now);
    let previous = last_month(now);
    let window = TimeWindow::six_months(now);

    let female = UserFilter {
        gender: Some(Gender::Female),
        ..Default::default()
    };
    let latest = OrderQuery {
        newest_first: true,
        limit: Some(LATEST_TRANSACTIONS),
        ..Default::default()
    };

    let this_month_products_query = products_created(current);
    let last_month_products_query = products_created(previous);
    let this_month_users_query = users_created(current);
    let last_month_users_query = users_created(previous);
    let this_month_orders_query = orders_created(current);
    let last_month_orders_query = orders_created(previous);
    let window_orders_query = orders_created(window.range());
    let every_product = ProductFilter::default();
    let every_user = UserFilter::default();
    let every_order = OrderQuery::default();

    let (
        this_month_products,
        last_month_products,
        this_month_users,
        last_month_users,
        this_month_orders,
        last_month_orders,
        window_orders,
        all_orders,
        product_total,
        user_total,
        female_total,
        latest_orders,
    ) = futures::try_join!(
        store.find_products(&this_month_products_query),
        store.find_products(&last_month_products_query),
        store.find_users(&this_month_users_query),
        store.find_users(&last_month_users_query),
        store.find_orders(&this_month_orders_query),
        store.find_orders(&last_month_orders_query),
        store.find_orders(&window_orders_query),
        store.find_orders(&every_order),
        store.count_products(&every_product),
        store.count_users(&every_user),
        store.count_users(&female),
        store.find_orders(&latest),
    )?;

    let change_percent = ChangePercent {
        revenue: percent_change(
            total_revenue(&this_month_orders),
            total_revenue(&last_month_orders),
        ),
        product: percent_change(
            this_month_products.len() as f64,
            last_month_products.len() as f64,
        ),
        user: percent_change(this_month_users.len() as f64, last_month_users.len() as f64),
        order: percent_change(
            this_month_orders.len() as f64,
            last_month_orders.len() as f64,
        ),
    };

    Ok(DashboardStats {
        category_count: category_shares(&store, product_total).await?,
        change_percent,
        count: Totals {
            revenue: total_revenue(&all_orders),
            product: product_total,
            user: user_total,
            order: all_orders.len() as u64,
        },
        chart: MonthlyOrders {
            orders: count_by_month(&window, &window_orders),
            revenue: sum_by_month(&window, &window_orders, |o| o.total),
        },
        user_ratio: UserRatio {
            male: user_total.saturating_sub(female_total),
            female: female_total,
        },
        latest_transactions: latest_orders.iter().map(Transaction::from).collect(),
    })
}

async fn load_pie_charts(
    store: Arc<dyn DocumentStore>,
    now: DateTime<Utc>,
) -> Result<PieCharts, CatalogError> {
    let processing_filter = order_status(OrderStatus::Processing);
    let shipped_filter = order_status(OrderStatus::Shipped);
    let delivered_filter = order_status(OrderStatus::Delivered);
    let admins_filter = user_role(Role::Admin);
    let customers_filter = user_role(Role::User);
    let every_product = ProductFilter::default();
    let sold_out = ProductFilter {
        out_of_stock: true,
        ..Default::default()
    };
    let every_order = OrderQuery::default();
    let every_user = UserFilter::default();

    let (processing, shipped, delivered, product_total, out_of_stock, orders, users, admins, customers) =
        futures::try_join!(
            store.count_orders(&processing_filter),
            store.count_orders(&shipped_filter),
            store.count_orders(&delivered_filter),
            store.count_products(&every_product),
            store.count_products(&sold_out),
            store.find_orders(&every_order),
            store.find_users(&every_user),
            store.count_users(&admins_filter),
            store.count_users(&customers_filter),
        )?;

    let gross_income = total_revenue(&orders);
    let discount: f64 = orders.iter().map(|o| o.discount).sum();
    let production_cost: f64 = orders.iter().map(|o| o.shipping_charges).sum();
    let burnt: f64 = orders.iter().map(|o| o.tax).sum();
    let marketing_cost = (gross_income * MARKETING_RATE).round();

    let today = now.date_naive();
    let mut age_groups = UserAgeGroups {
        teen: 0,
        adult: 0,
        old: 0,
    };
    for user in &users {
        match user.age_on(today) {
            0..=19 => age_groups.teen += 1,
            20..=39 => age_groups.adult += 1,
            _ => age_groups.old += 1,
        }
    }

    Ok(PieCharts {
        order_fulfillment: OrderFulfillment {
            processing,
            shipped,
            delivered,
        },
        product_categories: category_shares(&store, product_total).await?,
        stock_availability: StockAvailability {
            in_stock: product_total.saturating_sub(out_of_stock),
            out_of_stock,
        },
        revenue_distribution: RevenueDistribution {
            net_margin: gross_income - discount - production_cost - burnt - marketing_cost,
            discount,
            production_cost,
            burnt,
            marketing_cost,
        },
        admin_customer: AdminCustomer {
            admin: admins,
            customer: customers,
        },
        user_age_groups: age_groups,
    })
}

async fn load_bar_charts(
    store: Arc<dyn DocumentStore>,
    now: DateTime<Utc>,
) -> Result<BarCharts, CatalogError> {
    let six = TimeWindow::six_months(now);
    let twelve = TimeWindow::twelve_months(now);

    let product_query = products_created(six.range());
    let user_filter = users_created(six.range());
    let order_query = orders_created(twelve.range());

    let (products, users, orders) = futures::try_join!(
        store.find_products(&product_query),
        store.find_users(&user_filter),
        store.find_orders(&order_query),
    )?;

    Ok(BarCharts {
        products: count_by_month(&six, &products),
        users: count_by_month(&six, &users),
        orders: count_by_month(&twelve, &orders),
    })
}

async fn load_line_charts(
    store: Arc<dyn DocumentStore>,
    now: DateTime<Utc>,
) -> Result<LineCharts, CatalogError> {
    let window = TimeWindow::twelve_months(now);
    let range = window.range();
    let product_query = products_created(range);
    let user_filter = users_created(range);
    let order_query = orders_created(range);

    let (products, users, orders) = futures::try_join!(
        store.find_products(&product_query),
        store.find_users(&user_filter),
        store.find_orders(&order_query),
    )?;

    Ok(LineCharts {
        products: count_by_month(&window, &products),
        users: count_by_month(&window, &users),
        discount: sum_by_month(&window, &orders, |o| o.discount),
        revenue: sum_by_month(&window, &orders, |o| o.total),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::document_store::{new_id, InMemoryDocumentStore, OrderItem, Product, User};
    use crate::invalidation::InvalidationTags;
    use crate::kv_store::InMemoryKvStore;
    use chrono::{NaiveDate, TimeZone};

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 9, 30, 0).unwrap()
    }

    fn product(category: &str, stock: u32, created_at: DateTime<Utc>) -> Product {
        Product {
            id: new_id(),
            name: format!("{} item", category),
            price: 10.0,
            stock,
            category: category.to_string(),
            description: String::new(),
            photos: vec![],
            ratings: 0,
            num_of_reviews: 0,
            created_at,
        }
    }

    fn user(gender: Gender, role: Role, born: i32, created_at: DateTime<Utc>) -> User {
        User {
            id: new_id(),
            name: "someone".to_string(),
            gender,
            role,
            dob: NaiveDate::from_ymd_opt(born, 1, 1).unwrap(),
            created_at,
        }
    }

    fn order(total: f64, status: OrderStatus, created_at: DateTime<Utc>) -> Order {
        Order {
            id: new_id(),
            user_id: "u1".to_string(),
            items: vec![OrderItem {
                product_id: "p1".to_string(),
                name: "thing".to_string(),
                price: total,
                quantity: 1,
            }],
            subtotal: total,
            tax: 10.0,
            shipping_charges: 5.0,
            discount: 2.0,
            total,
            status,
            created_at,
        }
    }

    struct Harness {
        kv: Arc<InMemoryKvStore>,
        store: Arc<InMemoryDocumentStore>,
        context: CacheContext,
        dashboard: DashboardService,
    }

    // Reference instant is 15 March 2024
    async fn harness() -> Harness {
        let now = at(2024, 3, 15);
        let kv = Arc::new(InMemoryKvStore::new());
        let store = Arc::new(InMemoryDocumentStore::new());

        store.seed_product(product("home", 3, at(2024, 3, 2)));
        store.seed_product(product("home", 0, at(2024, 2, 29)));
        store.seed_product(product("books", 1, at(2023, 6, 1)));

        store.seed_user(user(Gender::Female, Role::Admin, 1990, at(2024, 3, 1)));
        store.seed_user(user(Gender::Male, Role::User, 2010, at(2024, 1, 10)));

        store.seed_order(order(100.0, OrderStatus::Processing, at(2024, 3, 10)));
        store.seed_order(order(50.0, OrderStatus::Delivered, at(2024, 2, 29)));
        store.seed_order(order(200.0, OrderStatus::Shipped, at(2023, 12, 5)));

        let context = CacheContext::connect(kv.clone(), &ServiceConfig::default())
            .await
            .unwrap();
        let dashboard =
            DashboardService::new(store.clone(), &context).with_clock(Arc::new(move || now));
        Harness {
            kv,
            store,
            context,
            dashboard,
        }
    }

    #[tokio::test]
    async fn test_stats() {
        let h = harness().await;
        let stats = h.dashboard.stats(&Actor::admin("a1")).await.unwrap();

        assert_eq!(
            stats.count,
            Totals {
                revenue: 350.0,
                product: 3,
                user: 2,
                order: 3,
            }
        );
        // the last day of February belongs to last month
        assert_eq!(stats.change_percent.revenue, 100.0);
        assert_eq!(stats.change_percent.product, 0.0);
        assert_eq!(stats.change_percent.user, 100.0);
        assert_eq!(stats.change_percent.order, 0.0);

        assert_eq!(stats.chart.orders, vec![0, 0, 1, 0, 1, 1]);
        assert_eq!(stats.chart.revenue, vec![0.0, 0.0, 200.0, 0.0, 50.0, 100.0]);
        assert_eq!(stats.user_ratio, UserRatio { male: 1, female: 1 });
        assert_eq!(
            stats.category_count,
            vec![
                CategoryShare {
                    category: "books".to_string(),
                    percent: 33
                },
                CategoryShare {
                    category: "home".to_string(),
                    percent: 67
                },
            ]
        );
        assert_eq!(stats.latest_transactions.len(), 3);
        assert_eq!(stats.latest_transactions[0].amount, 100.0);
        assert_eq!(stats.latest_transactions[0].quantity, 1);
    }

    #[tokio::test]
    async fn test_stats_are_cached_until_invalidated() {
        let h = harness().await;
        let admin = Actor::admin("a1");
        h.dashboard.stats(&admin).await.unwrap();
        assert!(h.kv.contains_key(ADMIN_STATS_KEY));

        h.store
            .seed_order(order(10.0, OrderStatus::Processing, at(2024, 3, 14)));
        assert_eq!(h.dashboard.stats(&admin).await.unwrap().count.order, 3);

        h.context
            .invalidate(&InvalidationTags::new().order().admin())
            .await
            .unwrap();
        assert_eq!(h.dashboard.stats(&admin).await.unwrap().count.order, 4);
    }

    #[tokio::test]
    async fn test_pie_charts_always_recomputed() {
        let h = harness().await;
        let admin = Actor::admin("a1");
        let pie = h.dashboard.pie_charts(&admin).await.unwrap();

        assert_eq!(
            pie.order_fulfillment,
            OrderFulfillment {
                processing: 1,
                shipped: 1,
                delivered: 1
            }
        );
        assert_eq!(
            pie.stock_availability,
            StockAvailability {
                in_stock: 2,
                out_of_stock: 1
            }
        );
        assert_eq!(pie.admin_customer, AdminCustomer { admin: 1, customer: 1 });
        assert_eq!(
            pie.user_age_groups,
            UserAgeGroups {
                teen: 1,
                adult: 1,
                old: 0
            }
        );

        let revenue = &pie.revenue_distribution;
        assert_eq!(revenue.marketing_cost, 105.0);
        assert_eq!(revenue.burnt, 30.0);
        assert_eq!(revenue.production_cost, 15.0);
        assert_eq!(revenue.discount, 6.0);
        assert_eq!(revenue.net_margin, 350.0 - 6.0 - 15.0 - 30.0 - 105.0);
        assert!(h.kv.contains_key(ADMIN_PIE_CHARTS_KEY));

        h.store.seed_product(product("toys", 0, at(2024, 3, 3)));
        let pie = h.dashboard.pie_charts(&admin).await.unwrap();
        assert_eq!(pie.stock_availability.out_of_stock, 2);
        assert_eq!(pie.product_categories.len(), 3);
    }

    #[tokio::test]
    async fn test_bar_and_line_charts() {
        let h = harness().await;
        let admin = Actor::admin("a1");

        let bar = h.dashboard.bar_charts(&admin).await.unwrap();
        assert_eq!(bar.products, vec![0, 0, 0, 0, 1, 1]);
        assert_eq!(bar.users, vec![0, 0, 0, 1, 0, 1]);
        assert_eq!(bar.orders.len(), 12);
        assert_eq!(bar.orders.iter().sum::<u64>(), 3);

        let line = h.dashboard.line_charts(&admin).await.unwrap();
        assert_eq!(line.products.len(), 12);
        // June 2023 is nine months back
        assert_eq!(line.products[2], 1);
        assert_eq!(line.revenue[11], 100.0);
        assert_eq!(line.discount.iter().sum::<f64>(), 6.0);
    }

    #[tokio::test]
    async fn test_dashboard_is_admin_only() {
        let h = harness().await;
        let customer = Actor::customer("u1");
        assert!(matches!(
            h.dashboard.stats(&customer).await,
            Err(CatalogError::Unauthorized(_))
        ));
        assert!(matches!(
            h.dashboard.line_charts(&customer).await,
            Err(CatalogError::Unauthorized(_))
        ));
        assert!(!h.kv.contains_key(ADMIN_STATS_KEY));
    }
}
