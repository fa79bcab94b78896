use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use types::ids::{InstrumentId, UserId};
use types::numeric::Price;

#[derive(Debug, Clone, Deserialize)]
pub struct DepositRequest {
    pub amount: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceRelayRequest {
    pub instrument: String,
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PriceRelayResponse {
    pub instrument: InstrumentId,
    pub price: Price,
}

/// First frame on a live-update socket
#[derive(Debug, Clone, Serialize)]
pub struct WsHello {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub user_id: UserId,
}
