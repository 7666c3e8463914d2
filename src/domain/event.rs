use super::topology::queues;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Cross-service domain events carried by the messaging layer.
///
/// The serde tag doubles as the envelope `type` and matches the name of the
/// well-known queue the event is published to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    #[serde(rename = "payment.created", rename_all = "camelCase")]
    PaymentCreated {
        payment_id: String,
        #[serde(with = "rust_decimal::serde::float")]
        amount: Decimal,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        currency: Option<String>,
    },
    #[serde(rename = "payment.succeeded", rename_all = "camelCase")]
    PaymentSucceeded {
        payment_id: String,
        #[serde(with = "rust_decimal::serde::float")]
        amount: Decimal,
    },
    #[serde(rename = "payment.failed", rename_all = "camelCase")]
    PaymentFailed { payment_id: String, reason: String },
    #[serde(rename = "balance.updated", rename_all = "camelCase")]
    BalanceUpdated {
        user_id: String,
        #[serde(with = "rust_decimal::serde::float")]
        balance: Decimal,
    },
}

impl DomainEvent {
    /// The well-known queue this event belongs on.
    pub fn queue(&self) -> &'static str {
        match self {
            Self::PaymentCreated { .. } => queues::PAYMENT_CREATED,
            Self::PaymentSucceeded { .. } => queues::PAYMENT_SUCCEEDED,
            Self::PaymentFailed { .. } => queues::PAYMENT_FAILED,
            Self::BalanceUpdated { .. } => queues::BALANCE_UPDATED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_payment_created_json_shape() {
        let event = DomainEvent::PaymentCreated {
            payment_id: "pm_1".to_string(),
            amount: dec!(1000),
            currency: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "payment.created");
        assert_eq!(value["paymentId"], "pm_1");
        assert_eq!(value["amount"].as_f64(), Some(1000.0));
        assert!(value.get("currency").is_none());
    }

    #[test]
    fn test_integer_amount_deserializes() {
        let event: DomainEvent =
            serde_json::from_value(json!({"type": "payment.created", "paymentId": "pm_1", "amount": 1000}))
                .unwrap();
        assert_eq!(
            event,
            DomainEvent::PaymentCreated {
                payment_id: "pm_1".to_string(),
                amount: dec!(1000),
                currency: None,
            }
        );
        assert_eq!(event.queue(), "payment.created");
    }

    #[test]
    fn test_queue_matches_tag() {
        let events = [
            DomainEvent::PaymentSucceeded {
                payment_id: "pm_1".to_string(),
                amount: dec!(12.5),
            },
            DomainEvent::PaymentFailed {
                payment_id: "pm_1".to_string(),
                reason: "card_declined".to_string(),
            },
            DomainEvent::BalanceUpdated {
                user_id: "u_1".to_string(),
                balance: dec!(42),
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.queue());
        }
    }
}
