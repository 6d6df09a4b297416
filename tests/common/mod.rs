use std::sync::Arc;

use rust_decimal_macros::dec;
use uuid::Uuid;

use fulfillment_core::{
    config::{AppConfig, PartialFulfillmentPolicy},
    db,
    entities::{order, product},
    events,
    services::{
        inventory::CreateProductInput,
        orders::{CreateOrderInput, OrderLineInput},
        InventoryService, OrderService, PackingService, PickingSessionService,
    },
    AppState,
};

/// Test harness backed by a throwaway file-based SQLite database with
/// migrations applied and the event loop running.
pub struct TestApp {
    pub state: AppState,
    pub tenant_id: Uuid,
    _event_task: tokio::task::JoinHandle<()>,
    _db_dir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestApp {
    pub async fn new() -> Self {
        Self::with_partial_fulfillment(PartialFulfillmentPolicy::Disallowed).await
    }

    pub async fn with_partial_fulfillment(policy: PartialFulfillmentPolicy) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("fulfillment_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "test".to_string(),
        );
        cfg.auto_migrate = true;
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.retry.base_backoff_ms = 1;
        cfg.partial_fulfillment = policy;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("db connect");

        let (sender, rx) = events::channel(256);
        let event_task = tokio::spawn(events::process_events(rx));

        let state = AppState::new(Arc::new(pool), cfg, sender);

        Self {
            state,
            tenant_id: Uuid::new_v4(),
            _event_task: event_task,
            _db_dir: dir,
        }
    }

    pub fn inventory(&self) -> &InventoryService {
        &self.state.services.inventory
    }

    pub fn orders(&self) -> &OrderService {
        &self.state.services.orders
    }

    pub fn picking(&self) -> &PickingSessionService {
        &self.state.services.picking
    }

    pub fn packing(&self) -> &PackingService {
        &self.state.services.packing
    }

    /// Registers a product with opening stock.
    pub async fn seed_product(&self, sku: &str, initial_stock: i32) -> product::Model {
        self.inventory()
            .create_product(CreateProductInput {
                sku: sku.to_string(),
                name: format!("Product {sku}"),
                unit_cost: dec!(10.00),
                initial_stock,
            })
            .await
            .expect("seed product")
    }

    /// Creates a confirmed order for this harness's tenant.
    pub async fn seed_order(&self, items: &[(Uuid, i32)]) -> order::Model {
        let (order, _) = self
            .orders()
            .create_order(CreateOrderInput {
                tenant_id: self.tenant_id,
                order_number: None,
                items: items
                    .iter()
                    .map(|(product_id, quantity)| OrderLineInput {
                        product_id: *product_id,
                        quantity: *quantity,
                    })
                    .collect(),
                notes: None,
            })
            .await
            .expect("seed order");
        order
    }
}
