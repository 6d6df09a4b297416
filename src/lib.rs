//! Fulfillment Core Library
//!
//! Turns confirmed orders into staged, packed, dispatch-ready shipments
//! while maintaining an auditable, concurrency-safe inventory ledger.
//! Orders are batched into picking sessions, picked stock is drained
//! into orders by the packing engine, and an order reaching full
//! allocation transitions state and permanently decrements stock.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod concurrency;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod logging;
pub mod migrator;
pub mod services;

use std::sync::Arc;

use crate::concurrency::RetryPolicy;

/// The crate's service bundle, wired over one connection pool and one
/// event channel.
#[derive(Clone)]
pub struct AppServices {
    pub inventory: services::InventoryService,
    pub orders: services::OrderService,
    pub picking: services::PickingSessionService,
    pub packing: services::PackingService,
}

impl AppServices {
    pub fn new(
        db: Arc<db::DbPool>,
        event_sender: events::EventSender,
        config: &config::AppConfig,
    ) -> Self {
        let retry_policy: RetryPolicy = (&config.retry).into();
        Self {
            inventory: services::InventoryService::new(
                db.clone(),
                event_sender.clone(),
                retry_policy.clone(),
            ),
            orders: services::OrderService::new(
                db.clone(),
                event_sender.clone(),
                retry_policy.clone(),
            ),
            picking: services::PickingSessionService::new(
                db.clone(),
                event_sender.clone(),
                retry_policy.clone(),
                config.partial_fulfillment,
            ),
            packing: services::PackingService::new(db, event_sender, retry_policy),
        }
    }
}

/// Everything an embedding application needs to drive the core.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<db::DbPool>,
    pub config: config::AppConfig,
    pub event_sender: events::EventSender,
    pub services: AppServices,
}

impl AppState {
    pub fn new(
        db: Arc<db::DbPool>,
        config: config::AppConfig,
        event_sender: events::EventSender,
    ) -> Self {
        let services = AppServices::new(db.clone(), event_sender.clone(), &config);
        Self {
            db,
            config,
            event_sender,
            services,
        }
    }
}
