mod admin;
pub mod auth;
mod bookings;
mod clients;
pub mod error;
pub mod metrics;
mod payments;
mod public;
pub mod rate_limit;
mod services;
mod sms;
mod validation;
mod work_shifts;

use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // OTP and admin login (strict rate limit)
    let auth_routes = Router::new()
        .route("/auth/otp/request", post(auth::request_otp))
        .route("/auth/otp/verify", post(auth::verify_otp))
        .route("/admin/auth/login", post(auth::admin_login))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_auth,
        ));

    // Booking pages, customer links and the payment return URL
    let public_routes = Router::new()
        .route("/public/:slug", get(public::business_profile))
        .route(
            "/public/:slug/available-times",
            get(public::public_available_times),
        )
        .route("/public/:slug/bookings", post(public::create_public_booking))
        .route("/customer/bookings/:token", get(public::customer_booking))
        .route(
            "/customer/bookings/:token/cancel",
            post(public::customer_cancel),
        )
        .route("/payments/callback", get(payments::payment_callback))
        .route("/plans", get(payments::list_plans))
        .route("/sms-packs", get(payments::list_sms_packs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_public,
        ));

    // Owner and admin API (auth checked by extractors)
    let api_routes = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        // Services
        .route(
            "/services",
            get(services::list_services).post(services::create_service),
        )
        .route(
            "/services/:id",
            put(services::update_service).delete(services::delete_service),
        )
        // Clients
        .route(
            "/clients",
            get(clients::list_clients).post(clients::create_client),
        )
        .route(
            "/clients/:id",
            get(clients::get_client)
                .put(clients::update_client)
                .delete(clients::delete_client),
        )
        .route("/clients/:id/bookings", get(clients::client_bookings))
        // Working hours and settings
        .route(
            "/work-shifts",
            get(work_shifts::list_work_shifts).put(work_shifts::replace_work_shifts),
        )
        .route(
            "/settings",
            get(work_shifts::get_settings).put(work_shifts::update_settings),
        )
        // Bookings
        .route(
            "/bookings",
            get(bookings::list_bookings).post(bookings::create_booking),
        )
        .route("/bookings/available-times", get(bookings::available_times))
        .route(
            "/bookings/:id",
            get(bookings::get_booking).put(bookings::update_booking),
        )
        .route("/bookings/:id/cancel", post(bookings::cancel_booking))
        .route("/bookings/:id/done", post(bookings::complete_booking))
        // SMS
        .route("/sms/send", post(sms::send_sms))
        .route("/sms/logs", get(sms::list_sms_logs))
        .route("/sms/balance", get(sms::sms_balance))
        .route(
            "/sms/templates",
            get(sms::list_templates).post(sms::create_template),
        )
        .route(
            "/sms/templates/:id",
            put(sms::update_template).delete(sms::delete_template),
        )
        // Payments
        .route("/payments", get(payments::list_purchases))
        .route("/payments/plan", post(payments::buy_plan))
        .route("/payments/sms-pack", post(payments::buy_sms_pack))
        // Admin
        .route("/admin/auth/logout", post(auth::admin_logout))
        .route("/admin/stats", get(admin::stats))
        .route("/admin/users", get(admin::list_users))
        .route("/admin/users/:id", put(admin::update_user))
        .route(
            "/admin/plans",
            get(admin::list_plans).post(admin::create_plan),
        )
        .route("/admin/plans/:id", put(admin::update_plan))
        .route(
            "/admin/sms-packs",
            get(admin::list_sms_packs).post(admin::create_sms_pack),
        )
        .route("/admin/sms-packs/:id", put(admin::update_sms_pack))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_api,
        ));

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .nest("/api", auth_routes.merge(public_routes).merge(api_routes))
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = cors_layer(&state.config.server.cors_origins) {
        router = router.layer(cors);
    }

    router.with_state(state)
}

/// Credentialed CORS for the configured dashboard origins
fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %o, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .allow_credentials(true),
    )
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{self, DbPool};
    use crate::payments::{PaymentError, PaymentGateway, PaymentRequest, PaymentSession};
    use crate::scheduling::BusinessClock;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct FakePaymentGateway;

    #[async_trait]
    impl PaymentGateway for FakePaymentGateway {
        async fn request(&self, _req: &PaymentRequest) -> Result<PaymentSession, PaymentError> {
            Ok(PaymentSession {
                authority: "A000123".to_string(),
                payment_url: "https://pay.test/StartPay/A000123".to_string(),
            })
        }

        async fn verify(&self, _authority: &str, _amount: i64) -> Result<String, PaymentError> {
            Ok("REF-77".to_string())
        }
    }

    struct TestApp {
        router: Router,
        db: DbPool,
        token: String,
        user_id: String,
        config: Config,
    }

    async fn setup(balance: i64) -> TestApp {
        setup_with(balance, |_| {}).await
    }

    async fn setup_with(balance: i64, configure: impl FnOnce(&mut Config)) -> TestApp {
        let db = db::init_in_memory().await.unwrap();
        db::seed_catalog(&db).await.unwrap();

        let mut config = Config::default();
        config.rate_limit.enabled = false;
        configure(&mut config);

        let user_id = "owner-1".to_string();
        sqlx::query(
            "INSERT INTO users (id, phone, name, business_name, slug, sms_balance) VALUES (?, '09120000001', 'Sara', 'Sara Salon', 'sara-salon', ?)",
        )
        .bind(&user_id)
        .bind(balance)
        .execute(&db)
        .await
        .unwrap();

        let token = auth::issue_token(&config.auth, &user_id, auth::ROLE_OWNER).unwrap();
        let state = Arc::new(AppState::new(
            config.clone(),
            db.clone(),
            Arc::new(FakePaymentGateway),
        ));

        TestApp {
            router: create_router(state),
            db,
            token,
            user_id,
            config,
        }
    }

    impl TestApp {
        async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let response = self.raw(method, uri, body, true).await;
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
        }

        async fn anonymous(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let response = self.raw(method, uri, body, false).await;
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
        }

        async fn raw(
            &self,
            method: Method,
            uri: &str,
            body: Option<Value>,
            authenticated: bool,
        ) -> axum::response::Response {
            let mut builder = Request::builder().method(method).uri(uri);
            if authenticated {
                builder = builder.header("Authorization", format!("Bearer {}", self.token));
            }
            let request = match body {
                Some(body) => builder
                    .header("Content-Type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            self.router.clone().oneshot(request).await.unwrap()
        }

        fn tomorrow(&self) -> String {
            let clock = BusinessClock::new(self.config.scheduling.utc_offset_minutes);
            (clock.now_local().date() + chrono::Duration::days(1))
                .format("%Y-%m-%d")
                .to_string()
        }

        fn yesterday(&self) -> String {
            let clock = BusinessClock::new(self.config.scheduling.utc_offset_minutes);
            (clock.now_local().date() - chrono::Duration::days(1))
                .format("%Y-%m-%d")
                .to_string()
        }

        async fn admin_token(&self) -> String {
            sqlx::query("INSERT INTO admins (id, username, password_hash) VALUES ('admin-1', 'root', 'x')")
                .execute(&self.db)
                .await
                .unwrap();
            auth::issue_token(&self.config.auth, "admin-1", auth::ROLE_ADMIN).unwrap()
        }

        async fn as_admin(
            &self,
            token: &str,
            method: Method,
            uri: &str,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let builder = Request::builder()
                .method(method)
                .uri(uri)
                .header("Authorization", format!("Bearer {}", token));
            let request = match body {
                Some(body) => builder
                    .header("Content-Type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
        }

        async fn count(&self, sql: &str, bind: &str) -> i64 {
            sqlx::query_scalar(sql).bind(bind).fetch_one(&self.db).await.unwrap()
        }

        async fn with_morning_shifts(&self) {
            let shifts: Vec<Value> = (0..7)
                .map(|d| json!({"weekday": d, "start_time": "09:00", "end_time": "12:00"}))
                .collect();
            let (status, _) = self
                .call(Method::PUT, "/api/work-shifts", Some(json!({ "shifts": shifts })))
                .await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = setup(0).await;
        let (status, _) = app.anonymous(Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_owner_routes_require_session() {
        let app = setup(0).await;
        let (status, body) = app.anonymous(Method::GET, "/api/services", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn test_booking_lifecycle() {
        let app = setup(10).await;
        app.with_morning_shifts().await;
        let date = app.tomorrow();

        let (status, service) = app
            .call(
                Method::POST,
                "/api/services",
                Some(json!({"name": "Haircut", "duration_minutes": 60, "price": 500000})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let service_id = service["id"].as_str().unwrap().to_string();

        let uri = format!(
            "/api/bookings/available-times?date={}&service_ids={}",
            date, service_id
        );
        let (status, day) = app.call(Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(day["times"], json!(["09:00", "09:30", "10:00", "10:30", "11:00"]));

        let request = json!({
            "client": {"name": "Ali", "phone": "+98 912 123 4567"},
            "date": date,
            "start_time": "09:30",
            "service_ids": [service_id],
        });
        let (status, booking) = app.call(Method::POST, "/api/bookings", Some(request.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(booking["client_phone"], "09121234567");
        assert_eq!(booking["duration_minutes"], 60);
        assert_eq!(booking["status"], "active");
        let booking_id = booking["id"].as_str().unwrap().to_string();

        // Overlapping slots disappear
        let (_, day) = app.call(Method::GET, &uri, None).await;
        assert_eq!(day["times"], json!(["10:30", "11:00"]));

        let (status, body) = app.call(Method::POST, "/api/bookings", Some(request)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "conflict");

        let cancel = format!("/api/bookings/{}/cancel", booking_id);
        let (status, booking) = app.call(Method::POST, &cancel, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(booking["status"], "cancelled");

        let (status, _) = app.call(Method::POST, &cancel, None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let done = format!("/api/bookings/{}/done", booking_id);
        let (status, _) = app.call(Method::POST, &done, None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        // Cancelled bookings free their slot
        let (_, day) = app.call(Method::GET, &uri, None).await;
        assert_eq!(day["times"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_booking_without_credit_is_rejected() {
        let app = setup(0).await;
        let date = app.tomorrow();

        let (status, template) = app
            .call(
                Method::POST,
                "/api/sms/templates",
                Some(json!({"name": "Confirm", "body": "Hi {name}, see you {date} {time}"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = app
            .call(
                Method::POST,
                "/api/bookings",
                Some(json!({
                    "client": {"name": "Ali", "phone": "09121234567"},
                    "date": date,
                    "start_time": "15:00",
                    "confirmation_template_id": template["id"],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"]["details"]["required"], 1);

        let bookings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bookings")
            .fetch_one(&app.db)
            .await
            .unwrap();
        assert_eq!(bookings, 0);
    }

    #[tokio::test]
    async fn test_confirmation_and_reminder_are_queued() {
        let app = setup(10).await;
        let date = app.tomorrow();

        let (_, template) = app
            .call(
                Method::POST,
                "/api/sms/templates",
                Some(json!({"name": "Notice", "body": "{name}: {date} {time}"})),
            )
            .await;
        let (status, booking) = app
            .call(
                Method::POST,
                "/api/bookings",
                Some(json!({
                    "client": {"name": "Ali", "phone": "09121234567"},
                    "date": date,
                    "start_time": "18:00",
                    "confirmation_template_id": template["id"],
                    "reminder_template_id": template["id"],
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let kinds: Vec<String> = sqlx::query_scalar(
            "SELECT l.kind FROM sms_logs l JOIN sms_jobs j ON j.log_id = l.id WHERE l.booking_id = ? ORDER BY j.run_at",
        )
        .bind(booking["id"].as_str().unwrap())
        .fetch_all(&app.db)
        .await
        .unwrap();
        assert_eq!(kinds, vec!["confirmation".to_string(), "reminder".to_string()]);

        // Cancelling drops the queued reminder
        let cancel = format!("/api/bookings/{}/cancel", booking["id"].as_str().unwrap());
        app.call(Method::POST, &cancel, None).await;
        let queued: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sms_jobs WHERE booking_id = ? AND status = 'queued'",
        )
        .bind(booking["id"].as_str().unwrap())
        .fetch_one(&app.db)
        .await
        .unwrap();
        assert_eq!(queued, 0);
    }

    #[tokio::test]
    async fn test_public_booking_and_customer_cancel() {
        let app = setup(0).await;
        app.with_morning_shifts().await;
        let date = app.tomorrow();

        let (status, profile) = app.anonymous(Method::GET, "/api/public/sara-salon", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(profile["business_name"], "Sara Salon");

        // Customers cannot book outside working hours
        let (status, _) = app
            .anonymous(
                Method::POST,
                "/api/public/sara-salon/bookings",
                Some(json!({"name": "Reza", "phone": "09351112233", "date": date, "start_time": "14:00"})),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, created) = app
            .anonymous(
                Method::POST,
                "/api/public/sara-salon/bookings",
                Some(json!({"name": "Reza", "phone": "09351112233", "date": date, "start_time": "10:00"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let token = created["customer_token"].as_str().unwrap().to_string();

        let view = format!("/api/customer/bookings/{}", token);
        let (status, booking) = app.anonymous(Method::GET, &view, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(booking["client_name"], "Reza");
        assert_eq!(booking["start_time"], "10:00");

        let cancel = format!("/api/customer/bookings/{}/cancel", token);
        let (status, booking) = app.anonymous(Method::POST, &cancel, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(booking["status"], "cancelled");

        let (status, _) = app.anonymous(Method::POST, &cancel, None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = app
            .anonymous(Method::GET, "/api/customer/bookings/unknown-token", None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tenants_are_isolated() {
        let app = setup(0).await;
        sqlx::query("INSERT INTO users (id, phone, slug) VALUES ('other', '09129999999', 'other-shop')")
            .execute(&app.db)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO clients (id, user_id, name, phone) VALUES ('c-other', 'other', 'Someone', '09121110000')",
        )
        .execute(&app.db)
        .await
        .unwrap();

        let (status, _) = app.call(Method::GET, "/api/clients/c-other", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (_, clients) = app.call(Method::GET, "/api/clients", None).await;
        assert_eq!(clients, json!([]));
    }

    #[tokio::test]
    async fn test_sms_pack_purchase_credits_once() {
        let app = setup(5).await;
        let pack_id: String = sqlx::query_scalar("SELECT id FROM sms_packs WHERE sms_count = 100")
            .fetch_one(&app.db)
            .await
            .unwrap();

        let (status, started) = app
            .call(
                Method::POST,
                "/api/payments/sms-pack",
                Some(json!({ "pack_id": pack_id })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(started["payment_url"], "https://pay.test/StartPay/A000123");

        for _ in 0..2 {
            let response = app
                .raw(
                    Method::GET,
                    "/api/payments/callback?Authority=A000123&Status=OK",
                    None,
                    false,
                )
                .await;
            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            let location = response.headers()[header::LOCATION].to_str().unwrap();
            assert!(location.ends_with("status=success"));
        }

        let balance: i64 = sqlx::query_scalar("SELECT sms_balance FROM users WHERE id = ?")
            .bind(&app.user_id)
            .fetch_one(&app.db)
            .await
            .unwrap();
        assert_eq!(balance, 105);
    }

    #[tokio::test]
    async fn test_owner_reschedule_moves_public_reminder() {
        let app = setup(10).await;
        app.with_morning_shifts().await;
        let date = app.tomorrow();

        let (status, created) = app
            .anonymous(
                Method::POST,
                "/api/public/sara-salon/bookings",
                Some(json!({"name": "Reza", "phone": "09351112233", "date": date, "start_time": "10:00"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let booking_id: String = sqlx::query_scalar("SELECT id FROM bookings WHERE customer_token = ?")
            .bind(created["customer_token"].as_str().unwrap())
            .fetch_one(&app.db)
            .await
            .unwrap();

        let (status, _) = app
            .call(
                Method::POST,
                "/api/bookings",
                Some(json!({
                    "client": {"name": "Ali", "phone": "09121234567"},
                    "date": date,
                    "start_time": "11:00",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let reminders = "SELECT COUNT(*) FROM sms_jobs j JOIN sms_logs l ON l.id = j.log_id
             WHERE j.booking_id = ? AND l.kind = 'reminder' AND j.status = 'queued'";
        assert_eq!(app.count(reminders, &booking_id).await, 1);

        let uri = format!("/api/bookings/{}", booking_id);
        let (status, body) = app
            .call(Method::PUT, &uri, Some(json!({"start_time": "11:00"})))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "conflict");

        // Growing into its own old slot is not a conflict
        let (status, booking) = app
            .call(Method::PUT, &uri, Some(json!({"duration_minutes": 60})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(booking["duration_minutes"], 60);
        assert_eq!(app.count(reminders, &booking_id).await, 1);

        let (status, booking) = app
            .call(Method::PUT, &uri, Some(json!({"start_time": "09:00"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(booking["start_time"], "09:00");
        assert_eq!(app.count(reminders, &booking_id).await, 1);
        let cancelled = "SELECT COUNT(*) FROM sms_jobs j JOIN sms_logs l ON l.id = j.log_id
             WHERE j.booking_id = ? AND l.kind = 'reminder' AND j.status = 'cancelled'";
        assert_eq!(app.count(cancelled, &booking_id).await, 1);
    }

    #[tokio::test]
    async fn test_sms_send_dedupes_and_counts_queued_credit() {
        let app = setup(2).await;
        let (status, client) = app
            .call(
                Method::POST,
                "/api/clients",
                Some(json!({"name": "Ali", "phone": "09121234567"})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, sent) = app
            .call(
                Method::POST,
                "/api/sms/send",
                Some(json!({
                    "client_ids": [client["id"]],
                    "phones": ["+98 912 123 4567", "09350000000", "0935 000 0000"],
                    "message": "Hello {name}",
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sent["queued"], 2);
        assert_eq!(sent["parts"], 2);

        // Both credits are promised to the queued messages
        let (status, body) = app
            .call(
                Method::POST,
                "/api/sms/send",
                Some(json!({"phones": ["09351110000"], "message": "Hi"})),
            )
            .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"]["details"]["required"], 1);
        assert_eq!(body["error"]["details"]["available"], 0);
    }

    #[tokio::test]
    async fn test_sms_log_page_out_of_range() {
        let app = setup(0).await;
        let (status, body) = app
            .call(
                Method::GET,
                "/api/sms/logs?page=9223372036854775807&per_page=100",
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "validation_error");

        let (status, page) = app.call(Method::GET, "/api/sms/logs?page=3", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["items"], json!([]));
    }

    #[tokio::test]
    async fn test_customer_cannot_cancel_past_booking() {
        let app = setup(0).await;
        sqlx::query("INSERT INTO clients (id, user_id, name, phone) VALUES ('c1', 'owner-1', 'Reza', '09351112233')")
            .execute(&app.db)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO bookings (id, user_id, client_id, date, start_time, duration_minutes, customer_token)
             VALUES ('b1', 'owner-1', 'c1', ?, '10:00', 30, 'past-token')",
        )
        .bind(app.yesterday())
        .execute(&app.db)
        .await
        .unwrap();

        let (status, body) = app
            .anonymous(Method::POST, "/api/customer/bookings/past-token/cancel", None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "conflict");
        assert_eq!(app.count("SELECT COUNT(*) FROM bookings WHERE id = ? AND status = 'active'", "b1").await, 1);
    }

    #[tokio::test]
    async fn test_otp_login_flow() {
        let app = setup(0).await;
        let phone = "09121112233";

        let (status, _) = app
            .anonymous(Method::POST, "/api/auth/otp/request", Some(json!({"phone": phone})))
            .await;
        assert_eq!(status, StatusCode::OK);
        let code_id: String = sqlx::query_scalar("SELECT id FROM otp_codes WHERE phone = ? AND consumed = 0")
            .bind(phone)
            .fetch_one(&app.db)
            .await
            .unwrap();
        sqlx::query("UPDATE otp_codes SET code_hash = ? WHERE id = ?")
            .bind(auth::hash_code("123456"))
            .bind(&code_id)
            .execute(&app.db)
            .await
            .unwrap();
        let verify = |code: &str| json!({"phone": phone, "code": code, "name": "Nima"});

        let (status, body) = app
            .anonymous(Method::POST, "/api/auth/otp/verify", Some(verify("000000")))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "unauthorized");
        assert_eq!(app.count("SELECT attempts FROM otp_codes WHERE id = ?", &code_id).await, 1);

        let max_attempts = app.config.auth.otp_max_attempts;
        sqlx::query("UPDATE otp_codes SET attempts = ? WHERE id = ?")
            .bind(max_attempts)
            .bind(&code_id)
            .execute(&app.db)
            .await
            .unwrap();
        let (status, _) = app
            .anonymous(Method::POST, "/api/auth/otp/verify", Some(verify("123456")))
            .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        sqlx::query("UPDATE otp_codes SET attempts = 0, expires_at = '2000-01-01T00:00:00Z' WHERE id = ?")
            .bind(&code_id)
            .execute(&app.db)
            .await
            .unwrap();
        let (status, _) = app
            .anonymous(Method::POST, "/api/auth/otp/verify", Some(verify("123456")))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        sqlx::query("UPDATE otp_codes SET expires_at = '2999-01-01T00:00:00Z' WHERE id = ?")
            .bind(&code_id)
            .execute(&app.db)
            .await
            .unwrap();
        let response = app
            .raw(Method::POST, "/api/auth/otp/verify", Some(verify("123456")), false)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with(&format!("{}=", app.config.auth.cookie_name)));
        assert!(cookie.contains("HttpOnly"));
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let login: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(login["is_new"], true);
        assert_eq!(login["user"]["name"], "Nima");
        assert_eq!(login["user"]["sms_balance"], app.config.sms.trial_balance);
        let slug = login["user"]["slug"].as_str().unwrap();
        assert_eq!(slug.len(), 9);
        assert_ne!(slug, "sara-salon");

        // A used code cannot be replayed
        let (status, _) = app
            .anonymous(Method::POST, "/api/auth/otp/verify", Some(verify("123456")))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_otp_requests_are_capped_per_phone() {
        let app = setup(0).await;
        let limit = app.config.auth.otp_requests_per_hour;
        let request = || Some(json!({"phone": "09121112233"}));

        for _ in 0..limit {
            let (status, _) = app.anonymous(Method::POST, "/api/auth/otp/request", request()).await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = app.anonymous(Method::POST, "/api/auth/otp/request", request()).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "too_many_requests");

        let sent = app
            .count("SELECT COUNT(*) FROM sms_logs WHERE phone = ? AND kind = 'otp'", "09121112233")
            .await;
        assert_eq!(sent, limit);

        let (status, _) = app
            .anonymous(Method::POST, "/api/auth/otp/request", Some(json!({"phone": "09121112244"})))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_forwarded_for_is_ignored_by_default() {
        let app = setup_with(0, |config| {
            config.rate_limit.enabled = true;
            config.rate_limit.auth_requests_per_window = 3;
        })
        .await;

        let mut statuses = Vec::new();
        for i in 0..5 {
            let request = Request::builder()
                .method(Method::POST)
                .uri("/api/auth/otp/request")
                .header("Content-Type", "application/json")
                .header("X-Forwarded-For", format!("203.0.113.{}", i))
                .body(Body::from(json!({"phone": format!("0912111220{}", i)}).to_string()))
                .unwrap();
            let response = app.router.clone().oneshot(request).await.unwrap();
            statuses.push(response.status());
        }
        assert_eq!(
            statuses,
            vec![
                StatusCode::OK,
                StatusCode::OK,
                StatusCode::OK,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::TOO_MANY_REQUESTS,
            ]
        );
    }

    #[tokio::test]
    async fn test_admin_routes() {
        let app = setup(10).await;

        // Owner sessions do not open admin routes
        let (status, body) = app.call(Method::GET, "/api/admin/stats", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "forbidden");

        let token = app.admin_token().await;
        let (status, stats) = app.as_admin(&token, Method::GET, "/api/admin/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["users"], 1);

        let (status, users) = app
            .as_admin(&token, Method::GET, "/api/admin/users?search=sara", None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(users.as_array().unwrap().len(), 1);

        let (status, user) = app
            .as_admin(
                &token,
                Method::PUT,
                "/api/admin/users/owner-1",
                Some(json!({"sms_balance_delta": -50})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(user["sms_balance"], 0);

        let (status, user) = app
            .as_admin(
                &token,
                Method::PUT,
                "/api/admin/users/owner-1",
                Some(json!({"sms_balance_delta": 25, "is_active": false})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(user["sms_balance"], 25);
        assert_eq!(user["is_active"], false);

        let (status, _) = app.call(Method::GET, "/api/services", None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .as_admin(&token, Method::PUT, "/api/admin/users/nobody", Some(json!({"is_active": true})))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, plan) = app
            .as_admin(
                &token,
                Method::POST,
                "/api/admin/plans",
                Some(json!({"name": "Gold", "price": 9000000, "duration_days": 30, "monthly_sms": 500})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, plans) = app.anonymous(Method::GET, "/api/plans", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(plans.as_array().unwrap().iter().any(|p| p["id"] == plan["id"]));
    }
}
