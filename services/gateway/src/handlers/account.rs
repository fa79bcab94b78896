use crate::auth::AuthenticatedUser;
use crate::error::AppError;
use crate::models::DepositRequest;
use crate::state::AppState;
use axum::{Json, extract::State};
use execution_engine::admission::PortfolioView;
use types::account::UserAccount;

pub async fn get_portfolio(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<PortfolioView>, AppError> {
    state
        .rate_limiter
        .check_rate_limit(&format!("{}:account_query", user.user_id))?;

    let view = state.engine.admission().portfolio_view(user.user_id).await?;
    Ok(Json(view))
}

pub async fn deposit(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<DepositRequest>,
) -> Result<Json<UserAccount>, AppError> {
    state
        .rate_limiter
        .check_rate_limit(&format!("{}:deposit", user.user_id))?;

    let account = state
        .engine
        .admission()
        .deposit(user.user_id, payload.amount)
        .await?;
    Ok(Json(account))
}
