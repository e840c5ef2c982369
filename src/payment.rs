use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::model::{Cents, PaymentMethod};

/// Proof of a charge. `captured` is false when money changes hands later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub reference: String,
    pub captured: bool,
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("payment provider unavailable: {0}")]
    Unavailable(String),
}

/// Payment capture lives outside this process.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(
        &self,
        amount: Cents,
        currency: &str,
        method: &PaymentMethod,
    ) -> Result<Receipt, PaymentError>;

    /// Reverse a captured charge whose booking was never committed.
    async fn void(&self, reference: &str, amount: Cents, currency: &str) -> Result<(), PaymentError>;
}

/// Default gateway: pay-at-venue is deferred, card tokens are accepted as captured.
pub struct DeferredGateway;

#[async_trait]
impl PaymentGateway for DeferredGateway {
    async fn charge(
        &self,
        amount: Cents,
        currency: &str,
        method: &PaymentMethod,
    ) -> Result<Receipt, PaymentError> {
        if amount < 0 {
            return Err(PaymentError::Declined(format!("negative amount {amount} {currency}")));
        }
        match method {
            PaymentMethod::PayAtVenue => Ok(Receipt {
                reference: format!("venue-{}", Ulid::new()),
                captured: false,
            }),
            PaymentMethod::Card { token } if token.is_empty() => {
                Err(PaymentError::Declined("empty card token".into()))
            }
            PaymentMethod::Card { .. } => Ok(Receipt {
                reference: format!("card-{}", Ulid::new()),
                captured: true,
            }),
        }
    }

    async fn void(&self, reference: &str, amount: Cents, currency: &str) -> Result<(), PaymentError> {
        if !reference.starts_with("card-") {
            return Err(PaymentError::Declined(format!("unknown charge {reference}")));
        }
        tracing::info!(reference, amount, currency, "charge voided");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn venue_payment_is_deferred() {
        let r = DeferredGateway
            .charge(1000, "USD", &PaymentMethod::PayAtVenue)
            .await
            .unwrap();
        assert!(!r.captured);
        assert!(r.reference.starts_with("venue-"));
    }

    #[tokio::test]
    async fn card_payment_is_captured() {
        let method = PaymentMethod::Card {
            token: "tok_visa".into(),
        };
        assert!(DeferredGateway.charge(1000, "USD", &method).await.unwrap().captured);
    }

    #[tokio::test]
    async fn only_card_charges_can_be_voided() {
        let method = PaymentMethod::Card {
            token: "tok_visa".into(),
        };
        let receipt = DeferredGateway.charge(1000, "USD", &method).await.unwrap();
        DeferredGateway.void(&receipt.reference, 1000, "USD").await.unwrap();
        assert!(DeferredGateway.void("venue-x", 1000, "USD").await.is_err());
    }

    #[tokio::test]
    async fn empty_token_is_declined() {
        let method = PaymentMethod::Card {
            token: String::new(),
        };
        assert!(matches!(
            DeferredGateway.charge(1000, "USD", &method).await,
            Err(PaymentError::Declined(_))
        ));
    }
}
