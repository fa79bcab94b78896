use crate::handlers::{account, order, price, ws};
use crate::state::AppState;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/orders", post(order::create_order))
        .route(
            "/orders/{id}",
            get(order::get_order)
                .patch(order::update_order)
                .delete(order::cancel_order),
        )
        .route("/portfolio", get(account::get_portfolio))
        .route("/accounts/deposit", post(account::deposit))
        .route("/prices", post(price::relay_price))
        .route("/ws", get(ws::ws_handler));

    Router::new()
        .nest("/v1", api_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use execution_engine::config::EngineConfig;
    use execution_engine::engine::EngineBuilder;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tower::ServiceExt;
    use crate::auth::Role;
    use types::ids::{InstrumentId, UserId};

    struct Harness {
        app: Router,
        state: AppState,
    }

    fn harness() -> Harness {
        let mut config = EngineConfig::default();
        config.session.always_open = true;
        let engine = Arc::new(EngineBuilder::new(config.clone()).build().unwrap());
        let state = AppState::new(engine, &config.gateway);
        Harness {
            app: create_router(state.clone()),
            state,
        }
    }

    impl Harness {
        fn token(&self, user: UserId) -> String {
            self.state.auth.issue(user, 4_000_000_000).unwrap()
        }

        fn relay_token(&self) -> String {
            self.state
                .auth
                .issue_as(UserId::new(), Role::Relay, 4_000_000_000)
                .unwrap()
        }

        async fn call(
            &self,
            method: &str,
            uri: &str,
            user: Option<UserId>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let token = user.map(|user| self.token(user));
            self.send(method, uri, token, body).await
        }

        async fn send(
            &self,
            method: &str,
            uri: &str,
            token: Option<String>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut request = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            let request = match body {
                Some(body) => request
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => request.body(Body::empty()).unwrap(),
            };

            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, value)
        }
    }

    #[tokio::test]
    async fn test_order_lifecycle_over_http() {
        let h = harness();
        let user = UserId::new();

        let (status, _) = h
            .call("POST", "/v1/accounts/deposit", Some(user), Some(json!({"amount": "10000"})))
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, order) = h
            .call(
                "POST",
                "/v1/orders",
                Some(user),
                Some(json!({
                    "instrument": "RELIANCE",
                    "side": "BUY",
                    "quantity": 10,
                    "kind": "LIMIT",
                    "price": "100"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", order);
        let id = order["order_id"].as_str().unwrap().to_string();

        let (status, updated) = h
            .call(
                "PATCH",
                &format!("/v1/orders/{}", id),
                Some(user),
                Some(json!({"price": "110"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", updated);

        let (status, view) = h.call("GET", "/v1/portfolio", Some(user), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["open_orders"].as_array().unwrap().len(), 1);

        let (status, _) = h
            .call("DELETE", &format!("/v1/orders/{}", id), Some(user), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = h
            .call("GET", &format!("/v1/orders/{}", id), Some(user), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_auth_and_ownership() {
        let h = harness();
        let (status, body) = h.call("GET", "/v1/portfolio", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "UNAUTHORIZED");

        let owner = UserId::new();
        let intruder = UserId::new();
        h.call("POST", "/v1/accounts/deposit", Some(owner), Some(json!({"amount": "500"})))
            .await;
        let (_, order) = h
            .call(
                "POST",
                "/v1/orders",
                Some(owner),
                Some(json!({
                    "instrument": "TCS",
                    "side": "BUY",
                    "quantity": 1,
                    "kind": "LIMIT",
                    "price": "100"
                })),
            )
            .await;
        let id = order["order_id"].as_str().unwrap().to_string();

        let (status, _) = h
            .call("DELETE", &format!("/v1/orders/{}", id), Some(intruder), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_rejections_carry_engine_codes() {
        let h = harness();
        let user = UserId::new();
        h.call("POST", "/v1/accounts/deposit", Some(user), Some(json!({"amount": "50"})))
            .await;

        let (status, body) = h
            .call(
                "POST",
                "/v1/orders",
                Some(user),
                Some(json!({
                    "instrument": "TCS",
                    "side": "BUY",
                    "quantity": 1,
                    "kind": "LIMIT",
                    "price": "100"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "INSUFFICIENT_FUNDS");

        let (status, body) = h
            .send(
                "POST",
                "/v1/prices",
                Some(h.relay_token()),
                Some(json!({"instrument": "TCS", "price": "-1"})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "VALIDATION_ERROR");

        let (status, body) = h
            .call("GET", "/v1/orders/not-a-uuid", Some(user), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_price_relay_requires_relay_role() {
        let h = harness();
        let tcs = InstrumentId::try_new("TCS").unwrap();

        let (status, body) = h
            .call(
                "POST",
                "/v1/prices",
                Some(UserId::new()),
                Some(json!({"instrument": "TCS", "price": "1"})),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "FORBIDDEN");
        assert!(h.state.engine.store().get_price(&tcs).await.unwrap().is_none());

        let (status, body) = h
            .send(
                "POST",
                "/v1/prices",
                Some(h.relay_token()),
                Some(json!({"instrument": "TCS", "price": "3500"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert!(h.state.engine.store().get_price(&tcs).await.unwrap().is_some());
    }
}
