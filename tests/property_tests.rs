//! Property-based checks on the order state machine.

use fulfillment_core::entities::order::OrderStatus;
use proptest::prelude::*;

const ALL_STATUSES: [OrderStatus; 8] = [
    OrderStatus::Confirmed,
    OrderStatus::InPreparation,
    OrderStatus::ReadyToShip,
    OrderStatus::Shipped,
    OrderStatus::Delivered,
    OrderStatus::Returned,
    OrderStatus::DeliveryFailed,
    OrderStatus::Cancelled,
];

fn any_status() -> impl Strategy<Value = OrderStatus> {
    prop::sample::select(ALL_STATUSES.to_vec())
}

proptest! {
    #[test]
    fn self_transitions_are_always_tolerated(status in any_status()) {
        prop_assert!(status.can_transition_to(status));
    }

    #[test]
    fn terminal_states_admit_no_exit(from in any_status(), to in any_status()) {
        let terminal = matches!(
            from,
            OrderStatus::Delivered
                | OrderStatus::Returned
                | OrderStatus::DeliveryFailed
                | OrderStatus::Cancelled
        );
        if terminal && from != to {
            prop_assert!(!from.can_transition_to(to));
        }
    }

    #[test]
    fn cancellation_implies_pre_shipment(from in any_status()) {
        if from != OrderStatus::Cancelled && from.can_transition_to(OrderStatus::Cancelled) {
            prop_assert!(from.is_pre_shipment());
        }
    }

    #[test]
    fn status_strings_round_trip(status in any_status()) {
        let parsed: OrderStatus = status.as_str().parse().unwrap();
        prop_assert_eq!(parsed, status);
        prop_assert_eq!(status.to_string(), status.as_str());
    }
}
