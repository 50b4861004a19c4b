use async_trait::async_trait;
use rust_decimal::Decimal;
use ulid::Ulid;

/// Ask the gateway to return `amount` of the payment behind `payment_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub refund_id: Ulid,
    pub payment_key: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Succeeded { transaction_key: String },
    Failed { reason: String },
}

/// Delivered asynchronously by the gateway once a refund settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundCallback {
    pub refund_id: Ulid,
    pub outcome: RefundOutcome,
}

#[derive(Debug, Clone)]
pub enum GatewayError {
    /// The gateway refused the request outright.
    Rejected { reason: String },
    Timeout,
    Other { message: String },
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected { reason } => write!(f, "refund rejected: {reason}"),
            Self::Timeout => write!(f, "gateway timeout"),
            Self::Other { message } => write!(f, "gateway error: {message}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Bridge to the card processor. Completion arrives later as a
/// [`RefundCallback`] handed to `Engine::handle_refund_callback`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn request_refund(&self, request: RefundRequest) -> Result<(), GatewayError>;
}
