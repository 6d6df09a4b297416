//! Order lifecycle: transition table enforcement, the all-or-nothing
//! ledger decrement, cancellation compensation, and the delete guard.

mod common;

use assert_matches::assert_matches;
use common::TestApp;
use fulfillment_core::{
    entities::order::OrderStatus,
    errors::{ErrorKind, ServiceError},
};
use uuid::Uuid;

#[tokio::test]
async fn orders_walk_the_happy_path() {
    let app = TestApp::new().await;
    let product = app.seed_product("ORD-001", 10).await;
    let order = app.seed_order(&[(product.id, 2)]).await;
    assert_eq!(order.status, OrderStatus::Confirmed.as_str());

    let order = app
        .orders()
        .transition(order.id, OrderStatus::InPreparation)
        .await
        .expect("prepare");
    let order = app
        .orders()
        .transition(order.id, OrderStatus::ReadyToShip)
        .await
        .expect("ready");
    assert_eq!(order.status, OrderStatus::ReadyToShip.as_str());

    // The decrement landed exactly once, per line item.
    assert_eq!(
        app.inventory().available_stock(product.id).await.unwrap(),
        8
    );

    let order = app.orders().mark_shipped(order.id).await.expect("ship");
    let order = app.orders().mark_delivered(order.id).await.expect("deliver");
    assert_eq!(order.status, OrderStatus::Delivered.as_str());
    assert!(app.orders().get_order(order.id).await.unwrap().version >= 4);
}

#[tokio::test]
async fn illegal_transitions_are_refused() {
    let app = TestApp::new().await;
    let product = app.seed_product("ORD-002", 10).await;
    let order = app.seed_order(&[(product.id, 1)]).await;

    let err = app
        .orders()
        .transition(order.id, OrderStatus::Shipped)
        .await
        .expect_err("confirmed cannot ship");
    assert_matches!(err, ServiceError::InvalidTransition { .. });
    assert_eq!(err.kind(), ErrorKind::Integrity);

    // Re-applying the current status is a tolerated no-op.
    let same = app
        .orders()
        .transition(order.id, OrderStatus::Confirmed)
        .await
        .expect("no-op");
    assert_eq!(same.status, OrderStatus::Confirmed.as_str());
}

#[tokio::test]
async fn the_decrement_is_all_or_nothing() {
    let app = TestApp::new().await;
    let p1 = app.seed_product("ORD-003A", 10).await;
    let p2 = app.seed_product("ORD-003B", 10).await;
    let p3 = app.seed_product("ORD-003C", 1).await;
    let order = app
        .seed_order(&[(p1.id, 2), (p2.id, 2), (p3.id, 2)])
        .await;

    app.orders()
        .transition(order.id, OrderStatus::InPreparation)
        .await
        .unwrap();

    // The third line lacks stock; no line may decrement.
    let err = app
        .orders()
        .transition(order.id, OrderStatus::ReadyToShip)
        .await
        .expect_err("short third line");
    assert_matches!(err, ServiceError::InsufficientStock(_));

    for product in [&p1, &p2, &p3] {
        let history = app.inventory().movement_history(product.id).await.unwrap();
        assert!(
            history.iter().all(|m| m.reference_type != "order"),
            "no order movement may survive the rollback"
        );
    }
    let order = app.orders().get_order(order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::InPreparation.as_str());

    // Restock the short product and retry; the whole decrement lands.
    app.inventory()
        .receive_stock(p3.id, 5, Uuid::new_v4())
        .await
        .unwrap();
    app.orders()
        .transition(order.id, OrderStatus::ReadyToShip)
        .await
        .expect("retry succeeds");
    assert_eq!(app.inventory().available_stock(p1.id).await.unwrap(), 8);
    assert_eq!(app.inventory().available_stock(p3.id).await.unwrap(), 4);
}

#[tokio::test]
async fn deleting_a_stock_affecting_order_is_protected() {
    let app = TestApp::new().await;
    let product = app.seed_product("ORD-004", 10).await;
    let order = app.seed_order(&[(product.id, 3)]).await;

    app.orders()
        .transition(order.id, OrderStatus::InPreparation)
        .await
        .unwrap();
    app.orders()
        .transition(order.id, OrderStatus::ReadyToShip)
        .await
        .unwrap();
    assert_eq!(
        app.inventory().available_stock(product.id).await.unwrap(),
        7
    );

    // The ledger has been affected; deletion is refused and changes nothing.
    let err = app
        .orders()
        .delete_order(order.id)
        .await
        .expect_err("protected");
    assert_matches!(err, ServiceError::StockAlreadyAffected(id) if id == order.id);
    assert!(app.orders().get_order(order.id).await.is_ok());

    // Cancelling writes compensating movements that restore stock.
    app.orders().cancel_order(order.id).await.expect("cancel");
    let recon = app.inventory().reconcile(product.id).await.unwrap();
    assert!(recon.consistent);
    assert_eq!(recon.current_stock, 10);

    let history = app.inventory().movement_history(product.id).await.unwrap();
    assert!(history
        .iter()
        .any(|m| m.reference_type == "order_cancellation" && m.delta == 3));

    // With the net effect back at zero, deletion goes through.
    app.orders().delete_order(order.id).await.expect("delete");
    let err = app.orders().get_order(order.id).await.expect_err("gone");
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn orders_without_ledger_effect_delete_cleanly() {
    let app = TestApp::new().await;
    let product = app.seed_product("ORD-005", 10).await;
    let order = app.seed_order(&[(product.id, 1)]).await;

    app.orders().delete_order(order.id).await.expect("delete");
    assert_matches!(
        app.orders().get_order(order.id).await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn session_members_cannot_be_deleted_while_the_session_lives() {
    let app = TestApp::new().await;
    let product = app.seed_product("ORD-006", 10).await;
    let order = app.seed_order(&[(product.id, 1)]).await;
    let detail = app.picking().create_session(vec![order.id]).await.unwrap();

    let err = app
        .orders()
        .delete_order(order.id)
        .await
        .expect_err("member of live session");
    assert_matches!(err, ServiceError::InvalidOperation(_));

    app.picking().cancel_session(detail.session.id).await.unwrap();
    app.orders().delete_order(order.id).await.expect("delete after cancel");
}

#[tokio::test]
async fn cancelling_a_session_member_shrinks_the_batch() {
    let app = TestApp::new().await;
    let product = app.seed_product("ORD-007", 20).await;
    let a = app.seed_order(&[(product.id, 2)]).await;
    let b = app.seed_order(&[(product.id, 3)]).await;
    let detail = app
        .picking()
        .create_session(vec![a.id, b.id])
        .await
        .unwrap();
    let session_id = detail.session.id;

    app.orders().cancel_order(a.id).await.expect("cancel member");

    let detail = app.picking().get_session(session_id).await.unwrap();
    assert_eq!(detail.orders.len(), 1);
    assert_eq!(detail.progress[0].quantity_needed, 3);

    // The rest of the batch still completes normally.
    app.picking()
        .record_picked(session_id, product.id, 3)
        .await
        .unwrap();
    app.picking().finish_picking(session_id, None).await.unwrap();
    for _ in 0..3 {
        app.packing()
            .pack_unit(session_id, b.id, product.id)
            .await
            .unwrap();
    }
    app.packing().complete_session(session_id).await.unwrap();

    assert_eq!(
        app.inventory().available_stock(product.id).await.unwrap(),
        17
    );
}

#[tokio::test]
async fn cancelled_orders_stay_cancelled() {
    let app = TestApp::new().await;
    let product = app.seed_product("ORD-008", 10).await;
    let order = app.seed_order(&[(product.id, 1)]).await;

    app.orders().cancel_order(order.id).await.expect("cancel");
    // Repeat cancellation is a no-op, not an error.
    let order = app.orders().cancel_order(order.id).await.expect("repeat");
    assert_eq!(order.status, OrderStatus::Cancelled.as_str());

    let err = app
        .orders()
        .transition(order.id, OrderStatus::InPreparation)
        .await
        .expect_err("cancelled is terminal");
    assert_matches!(err, ServiceError::InvalidTransition { .. });
}

#[tokio::test]
async fn delivery_failures_branch_off_shipped() {
    let app = TestApp::new().await;
    let product = app.seed_product("ORD-009", 10).await;
    let order = app.seed_order(&[(product.id, 1)]).await;

    app.orders()
        .transition(order.id, OrderStatus::InPreparation)
        .await
        .unwrap();
    app.orders()
        .transition(order.id, OrderStatus::ReadyToShip)
        .await
        .unwrap();
    app.orders().mark_shipped(order.id).await.unwrap();

    let order = app
        .orders()
        .mark_delivery_failed(order.id)
        .await
        .expect("delivery failed");
    assert_eq!(order.status, OrderStatus::DeliveryFailed.as_str());

    let err = app.orders().cancel_order(order.id).await.expect_err("too late");
    assert_matches!(err, ServiceError::InvalidTransition { .. });
}
