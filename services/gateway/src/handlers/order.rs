use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use execution_engine::admission::{PlaceOrder, UpdateOrder};
use types::ids::OrderId;
use types::order::Order;

fn parse_order_id(raw: &str) -> Result<OrderId, AppError> {
    raw.parse()
        .map_err(|_| AppError::BadRequest(format!("invalid order id {:?}", raw)))
}

pub async fn create_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<PlaceOrder>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    state
        .rate_limiter
        .check_rate_limit(&format!("{}:order_placement", user.user_id))?;

    let order = state.engine.admission().place(user.user_id, payload).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

pub async fn update_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(order_id): Path<String>,
    Json(payload): Json<UpdateOrder>,
) -> Result<Json<Order>, AppError> {
    state
        .rate_limiter
        .check_rate_limit(&format!("{}:order_update", user.user_id))?;

    let order_id = parse_order_id(&order_id)?;
    let order = state
        .engine
        .admission()
        .update(user.user_id, order_id, payload)
        .await?;
    Ok(Json(order))
}

pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(order_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state
        .rate_limiter
        .check_rate_limit(&format!("{}:order_cancel", user.user_id))?;

    let order_id = parse_order_id(&order_id)?;
    state.engine.admission().cancel(user.user_id, order_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(order_id): Path<String>,
) -> Result<Json<Order>, AppError> {
    state
        .rate_limiter
        .check_rate_limit(&format!("{}:order_query", user.user_id))?;

    let order_id = parse_order_id(&order_id)?;
    let order = state.engine.admission().get_order(user.user_id, order_id).await?;
    Ok(Json(order))
}
