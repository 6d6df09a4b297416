//! Packing allocation engine: basket drain, per-order bounds, atomic
//! order completion, and session completion.

mod common;

use assert_matches::assert_matches;
use common::TestApp;
use fulfillment_core::{
    config::PartialFulfillmentPolicy,
    entities::{order::OrderStatus, picking_session::SessionStatus},
    errors::ServiceError,
    services::picking::ShortfallAck,
};
use uuid::Uuid;

/// Builds a session with orders A (2 of the product) and B (3 of it),
/// fully picked and moved to packing.
async fn packing_session(app: &TestApp) -> (Uuid, Uuid, Uuid, Uuid) {
    let product = app.seed_product(&format!("PAK-{}", Uuid::new_v4().simple()), 10).await;
    let a = app.seed_order(&[(product.id, 2)]).await;
    let b = app.seed_order(&[(product.id, 3)]).await;
    let detail = app
        .picking()
        .create_session(vec![a.id, b.id])
        .await
        .expect("session");
    let session_id = detail.session.id;
    app.picking()
        .record_picked(session_id, product.id, 5)
        .await
        .expect("pick");
    app.picking()
        .finish_picking(session_id, None)
        .await
        .expect("finish picking");
    (session_id, a.id, b.id, product.id)
}

#[tokio::test]
async fn basket_drains_into_both_orders_and_the_ledger_closes_at_minus_five() {
    let app = TestApp::new().await;
    let (session_id, a, b, product_id) = packing_session(&app).await;

    // Interleave A and B allocations.
    for order_id in [a, b, b, a, b] {
        app.packing()
            .pack_unit(session_id, order_id, product_id)
            .await
            .expect("pack unit");
    }

    let order_a = app.orders().get_order(a).await.unwrap();
    let order_b = app.orders().get_order(b).await.unwrap();
    assert_eq!(order_a.status, OrderStatus::ReadyToShip.as_str());
    assert_eq!(order_b.status, OrderStatus::ReadyToShip.as_str());

    let session = app
        .packing()
        .complete_session(session_id)
        .await
        .expect("complete");
    assert_eq!(session.status, SessionStatus::Completed.as_str());

    // 10 seeded, 5 permanently decremented across the two orders.
    let recon = app.inventory().reconcile(product_id).await.unwrap();
    assert!(recon.consistent);
    assert_eq!(recon.current_stock, 5);

    let order_deltas: i32 = app
        .inventory()
        .movement_history(product_id)
        .await
        .unwrap()
        .iter()
        .filter(|m| m.reference_type == "order")
        .map(|m| m.delta)
        .sum();
    assert_eq!(order_deltas, -5);
}

#[tokio::test]
async fn the_reverse_interleaving_reaches_the_same_state() {
    let app = TestApp::new().await;
    let (session_id, a, b, product_id) = packing_session(&app).await;

    for order_id in [b, a, a, b, b] {
        app.packing()
            .pack_unit(session_id, order_id, product_id)
            .await
            .expect("pack unit");
    }

    app.packing()
        .complete_session(session_id)
        .await
        .expect("complete");

    let recon = app.inventory().reconcile(product_id).await.unwrap();
    assert!(recon.consistent);
    assert_eq!(recon.current_stock, 5);
}

#[tokio::test]
async fn an_order_cannot_take_more_than_its_own_requirement() {
    let app = TestApp::new().await;
    let (session_id, a, _b, product_id) = packing_session(&app).await;

    app.packing().pack_unit(session_id, a, product_id).await.unwrap();
    app.packing().pack_unit(session_id, a, product_id).await.unwrap();

    // Basket still has units, but A is at its own bound.
    let err = app
        .packing()
        .pack_unit(session_id, a, product_id)
        .await
        .expect_err("A is full");
    assert_matches!(
        err,
        ServiceError::AlreadyFullyPacked {
            quantity_needed: 2,
            ..
        }
    );
}

#[tokio::test]
async fn an_exhausted_basket_refuses_further_allocation() {
    let app =
        TestApp::with_partial_fulfillment(PartialFulfillmentPolicy::WithAcknowledgement).await;
    let product = app.seed_product("PAK-SHORT", 10).await;
    let a = app.seed_order(&[(product.id, 2)]).await;
    let detail = app.picking().create_session(vec![a.id]).await.unwrap();
    let session_id = detail.session.id;

    // Only one of two units was physically picked.
    app.picking()
        .record_picked(session_id, product.id, 1)
        .await
        .unwrap();
    app.picking()
        .finish_picking(
            session_id,
            Some(ShortfallAck {
                acknowledged_by: Uuid::new_v4(),
                note: None,
            }),
        )
        .await
        .unwrap();

    app.packing()
        .pack_unit(session_id, a.id, product.id)
        .await
        .expect("first unit");

    let err = app
        .packing()
        .pack_unit(session_id, a.id, product.id)
        .await
        .expect_err("basket is dry");
    assert_matches!(err, ServiceError::NoUnitsAvailable { .. });

    // Completion names the short line.
    let err = app
        .packing()
        .complete_session(session_id)
        .await
        .expect_err("incomplete order");
    match err {
        ServiceError::IncompleteOrders(short) => {
            assert_eq!(short.len(), 1);
            assert_eq!(short[0].order_id, a.id);
            assert_eq!(short[0].product_id, product.id);
            assert_eq!(short[0].short_by(), 1);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn the_last_unit_transitions_the_order_atomically() {
    let app = TestApp::new().await;
    let (session_id, a, _b, product_id) = packing_session(&app).await;

    let first = app
        .packing()
        .pack_unit(session_id, a, product_id)
        .await
        .unwrap();
    assert_eq!(first.quantity_packed, 1);
    assert!(!first.order_completed);
    assert_eq!(first.order.status, OrderStatus::InPreparation.as_str());

    // No ledger effect until the order completes.
    assert_eq!(
        app.inventory().available_stock(product_id).await.unwrap(),
        10
    );

    let second = app
        .packing()
        .pack_unit(session_id, a, product_id)
        .await
        .unwrap();
    assert!(second.order_completed);
    assert_eq!(second.order.status, OrderStatus::ReadyToShip.as_str());

    // The decrement landed with the same commit.
    assert_eq!(
        app.inventory().available_stock(product_id).await.unwrap(),
        8
    );
}

#[tokio::test]
async fn a_failed_stock_check_rolls_back_the_whole_pack() {
    let app = TestApp::new().await;
    // Ledger says one unit, but the order needs two; the shelf count and
    // the ledger disagree and the decrement must refuse.
    let product = app.seed_product("PAK-DRIFT", 1).await;
    let a = app.seed_order(&[(product.id, 2)]).await;
    let detail = app.picking().create_session(vec![a.id]).await.unwrap();
    let session_id = detail.session.id;

    app.picking()
        .record_picked(session_id, product.id, 2)
        .await
        .unwrap();
    app.picking().finish_picking(session_id, None).await.unwrap();

    app.packing()
        .pack_unit(session_id, a.id, product.id)
        .await
        .expect("first unit packs fine");

    let err = app
        .packing()
        .pack_unit(session_id, a.id, product.id)
        .await
        .expect_err("completing the order must fail the stock check");
    assert_matches!(err, ServiceError::InsufficientStock(_));

    // All-or-nothing: the increment rolled back with the transition.
    let list = app.packing().get_packing_list(session_id).await.unwrap();
    assert_eq!(list.orders[0].lines[0].quantity_packed, 1);
    let order = app.orders().get_order(a.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::InPreparation.as_str());
    assert!(app
        .inventory()
        .movement_history(product.id)
        .await
        .unwrap()
        .iter()
        .all(|m| m.reference_type != "order"));
}

#[tokio::test]
async fn packing_list_reports_orders_and_basket() {
    let app = TestApp::new().await;
    let (session_id, a, b, product_id) = packing_session(&app).await;

    app.packing().pack_unit(session_id, a, product_id).await.unwrap();

    let list = app.packing().get_packing_list(session_id).await.unwrap();
    assert_eq!(list.orders.len(), 2);
    let a_status = list.orders.iter().find(|o| o.order_id == a).unwrap();
    assert_eq!(a_status.lines[0].quantity_packed, 1);
    assert!(!a_status.complete);
    let b_status = list.orders.iter().find(|o| o.order_id == b).unwrap();
    assert_eq!(b_status.lines[0].quantity_packed, 0);

    assert_eq!(list.basket.len(), 1);
    assert_eq!(list.basket[0].quantity_picked, 5);
    assert_eq!(list.basket[0].quantity_packed, 1);
    assert_eq!(list.basket[0].remaining, 4);
}

#[tokio::test]
async fn packing_rejects_foreign_lines_and_wrong_phase() {
    let app = TestApp::new().await;
    let product = app.seed_product("PAK-MISC", 10).await;
    let other = app.seed_product("PAK-MISC2", 10).await;
    let a = app.seed_order(&[(product.id, 1)]).await;
    let detail = app.picking().create_session(vec![a.id]).await.unwrap();
    let session_id = detail.session.id;

    // Still picking: no packing operations yet.
    let err = app
        .packing()
        .pack_unit(session_id, a.id, product.id)
        .await
        .expect_err("still picking");
    assert_matches!(err, ServiceError::InvalidOperation(_));

    app.picking()
        .record_picked(session_id, product.id, 1)
        .await
        .unwrap();
    app.picking().finish_picking(session_id, None).await.unwrap();

    let err = app
        .packing()
        .pack_unit(session_id, a.id, other.id)
        .await
        .expect_err("product not in session");
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn complete_session_is_idempotent() {
    let app = TestApp::new().await;
    let (session_id, a, b, product_id) = packing_session(&app).await;
    for order_id in [a, a, b, b, b] {
        app.packing()
            .pack_unit(session_id, order_id, product_id)
            .await
            .unwrap();
    }

    app.packing().complete_session(session_id).await.unwrap();
    let session = app
        .packing()
        .complete_session(session_id)
        .await
        .expect("repeat completion is a no-op");
    assert_eq!(session.status, SessionStatus::Completed.as_str());
}

#[tokio::test]
async fn concurrent_packers_never_overdraw_the_basket() {
    let app = TestApp::new().await;
    let (session_id, a, b, product_id) = packing_session(&app).await;

    // 10 workers race to place 5 units into orders bounded at 2 and 3.
    let mut tasks = Vec::new();
    for i in 0..10 {
        let packing = app.packing().clone();
        let order_id = if i % 2 == 0 { a } else { b };
        tasks.push(tokio::spawn(async move {
            packing.pack_unit(session_id, order_id, product_id).await
        }));
    }

    let mut packed = 0;
    for task in tasks {
        match task.await.expect("join") {
            Ok(_) => packed += 1,
            Err(ServiceError::AlreadyFullyPacked { .. })
            | Err(ServiceError::NoUnitsAvailable { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(packed, 5, "exactly the picked units may be allocated");

    let list = app.packing().get_packing_list(session_id).await.unwrap();
    assert_eq!(list.basket[0].remaining, 0);
    assert_eq!(list.basket[0].quantity_packed, 5);
}
