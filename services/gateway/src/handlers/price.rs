use crate::auth::{AuthenticatedUser, Role};
use crate::error::AppError;
use crate::models::{PriceRelayRequest, PriceRelayResponse};
use crate::state::AppState;
use axum::{Json, extract::State};
use types::ids::InstrumentId;

/// Relay an observed market price into the engine. Relay tokens only.
pub async fn relay_price(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<PriceRelayRequest>,
) -> Result<Json<PriceRelayResponse>, AppError> {
    user.require(Role::Relay)?;
    state
        .rate_limiter
        .check_rate_limit(&format!("{}:price_relay", user.user_id))?;

    let price = state
        .engine
        .admission()
        .relay_price(&payload.instrument, payload.price)
        .await?;
    tracing::debug!(instrument = %payload.instrument, %price, user_id = %user.user_id, "Price relayed");

    let instrument = InstrumentId::try_new(payload.instrument.as_str())
        .ok_or_else(|| AppError::BadRequest("invalid instrument".into()))?;
    Ok(Json(PriceRelayResponse { instrument, price }))
}
