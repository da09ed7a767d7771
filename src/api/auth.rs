use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::request::Parts,
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

use super::error::ApiError;
use crate::config::AuthConfig;
use crate::db::{
    self, Admin, AdminLoginRequest, LoginResponse, OtpCode, OtpRequest, OtpVerifyRequest, SmsKind,
    User, UserResponse,
};
use crate::sms::{normalize_phone, OutgoingSms, SmsContent};
use crate::{AppState, DbPool};

pub const ROLE_OWNER: &str = "owner";
pub const ROLE_ADMIN: &str = "admin";

/// Session token payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingSession,
    #[error("Session is invalid or expired")]
    InvalidSession,
    #[error("Account is disabled")]
    Inactive,
    #[error("Admin access required")]
    NotAdmin,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingSession | AuthError::InvalidSession => {
                ApiError::unauthorized(err.to_string())
            }
            AuthError::Inactive | AuthError::NotAdmin => ApiError::forbidden(err.to_string()),
            AuthError::Database(e) => e.into(),
        }
    }
}

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt_bytes: [u8; 16] = rand::rng().random();
    let salt = SaltString::encode_b64(&salt_bytes)?;
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// Random opaque token, used for customer booking links
pub fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 16] = rng.random();
    hex::encode(bytes)
}

fn generate_otp() -> String {
    format!("{:06}", rand::rng().random_range(0..1_000_000u32))
}

/// SHA-256 of a login code; only the hash is stored
pub(crate) fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn issue_token(config: &AuthConfig, subject: &str, role: &str) -> Result<String, ApiError> {
    let now = Utc::now();
    let claims = Claims {
        sub: subject.to_string(),
        role: role.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::days(config.session_days)).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!(error = %e, "Failed to sign session token");
        ApiError::internal("Failed to create session")
    })
}

pub fn verify_token(config: &AuthConfig, token: &str) -> Result<Claims, AuthError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.jwt_secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
    .map_err(|_| AuthError::InvalidSession)
}

fn session_cookie(config: &AuthConfig, name: &str, token: String) -> Cookie<'static> {
    Cookie::build((name.to_owned(), token))
        .path("/")
        .http_only(true)
        .secure(config.cookie_secure)
        .same_site(SameSite::Lax)
        .build()
}

fn removal_cookie(name: &str) -> Cookie<'static> {
    Cookie::build((name.to_owned(), "")).path("/").build()
}

/// Session token from the named cookie, or a `Bearer` header for API clients
fn extract_token(parts: &Parts, cookie_name: &str) -> Option<String> {
    if let Some(auth_header) = parts
        .headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = auth_header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }

    CookieJar::from_headers(&parts.headers)
        .get(cookie_name)
        .map(|c| c.value().to_string())
}

/// The authenticated business owner
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth = &state.config.auth;
        let token = extract_token(parts, &auth.cookie_name).ok_or(AuthError::MissingSession)?;
        let claims = verify_token(auth, &token)?;
        if claims.role != ROLE_OWNER {
            return Err(AuthError::InvalidSession.into());
        }

        let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(&claims.sub)
            .fetch_optional(&state.db)
            .await
            .map_err(AuthError::from)?
            .ok_or(AuthError::InvalidSession)?;

        if !user.is_active() {
            return Err(AuthError::Inactive.into());
        }
        Ok(AuthUser(user))
    }
}

/// The authenticated platform administrator
#[derive(Debug, Clone)]
pub struct AdminUser(pub Admin);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth = &state.config.auth;
        let token =
            extract_token(parts, &auth.admin_cookie_name).ok_or(AuthError::MissingSession)?;
        let claims = verify_token(auth, &token)?;
        if claims.role != ROLE_ADMIN {
            return Err(AuthError::NotAdmin.into());
        }

        let admin: Admin = sqlx::query_as("SELECT * FROM admins WHERE id = ?")
            .bind(&claims.sub)
            .fetch_optional(&state.db)
            .await
            .map_err(AuthError::from)?
            .ok_or(AuthError::InvalidSession)?;
        Ok(AdminUser(admin))
    }
}

/// Slug not yet used by any business
async fn unique_slug(db: &DbPool) -> Result<String, sqlx::Error> {
    loop {
        let slug = format!("b{:08x}", rand::rng().random::<u32>());
        let taken: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE slug = ?")
            .bind(&slug)
            .fetch_one(db)
            .await?;
        if taken == 0 {
            return Ok(slug);
        }
    }
}

/// POST /api/auth/otp/request
pub async fn request_otp(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OtpRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let phone = normalize_phone(&req.phone, &state.config.sms.country_code)?;
    let code = generate_otp();
    let now = Utc::now();
    let expires_at = db::timestamp(now + Duration::seconds(state.config.auth.otp_ttl_seconds));

    // Codes per phone per hour; every code carries its own attempt budget
    let recent: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM otp_codes WHERE phone = ? AND created_at > ?")
            .bind(&phone)
            .bind(db::timestamp(now - Duration::hours(1)))
            .fetch_one(&state.db)
            .await?;
    if recent >= state.config.auth.otp_requests_per_hour {
        tracing::warn!(phone = %phone, recent, "Login code requests throttled");
        return Err(ApiError::rate_limited(
            "Too many codes requested for this phone, try again later",
        ));
    }

    sqlx::query("UPDATE otp_codes SET consumed = 1 WHERE phone = ? AND consumed = 0")
        .bind(&phone)
        .execute(&state.db)
        .await?;

    sqlx::query(
        "INSERT INTO otp_codes (id, phone, code_hash, expires_at, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&phone)
    .bind(hash_code(&code))
    .bind(&expires_at)
    .bind(db::timestamp(now))
    .execute(&state.db)
    .await?;

    let content = match &state.config.sms.otp_pattern_code {
        Some(pattern) => SmsContent::Pattern {
            code: pattern.clone(),
            variables: BTreeMap::from([("code".to_string(), code)]),
        },
        None => SmsContent::text(format!("کد ورود شما به آن‌تایم: {}", code)),
    };

    state
        .sms
        .enqueue(
            OutgoingSms {
                user_id: None,
                booking_id: None,
                phone: phone.clone(),
                content,
                kind: SmsKind::Otp,
            },
            Duration::zero(),
        )
        .await?;

    tracing::info!(phone = %phone, "Login code sent");

    Ok(Json(serde_json::json!({
        "message": "Verification code sent",
        "expires_in": state.config.auth.otp_ttl_seconds,
    })))
}

/// POST /api/auth/otp/verify
pub async fn verify_otp(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<OtpVerifyRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), ApiError> {
    let phone = normalize_phone(&req.phone, &state.config.sms.country_code)?;
    let invalid = || ApiError::unauthorized("Invalid or expired code");

    let otp: OtpCode = sqlx::query_as(
        "SELECT * FROM otp_codes WHERE phone = ? AND consumed = 0 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(&phone)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(invalid)?;

    let now = db::now();
    if otp.expires_at <= now {
        return Err(invalid());
    }
    if otp.attempts >= state.config.auth.otp_max_attempts {
        return Err(ApiError::rate_limited(
            "Too many attempts, request a new code",
        ));
    }

    let matches: bool = hash_code(req.code.trim())
        .as_bytes()
        .ct_eq(otp.code_hash.as_bytes())
        .into();
    if !matches {
        sqlx::query("UPDATE otp_codes SET attempts = attempts + 1 WHERE id = ?")
            .bind(&otp.id)
            .execute(&state.db)
            .await?;
        tracing::warn!(phone = %phone, attempts = otp.attempts + 1, "Wrong login code");
        return Err(invalid());
    }

    sqlx::query("UPDATE otp_codes SET consumed = 1 WHERE id = ?")
        .bind(&otp.id)
        .execute(&state.db)
        .await?;

    let existing: Option<User> = sqlx::query_as("SELECT * FROM users WHERE phone = ?")
        .bind(&phone)
        .fetch_optional(&state.db)
        .await?;

    let (user, is_new) = match existing {
        Some(user) => (user, false),
        None => {
            let id = uuid::Uuid::new_v4().to_string();
            let name = req.name.as_deref().map(str::trim).unwrap_or("").to_string();
            sqlx::query(
                r#"
                INSERT INTO users (id, phone, name, slug, sms_balance, reminder_minutes, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(&phone)
            .bind(&name)
            .bind(unique_slug(&state.db).await?)
            .bind(state.config.sms.trial_balance)
            .bind(state.config.sms.default_reminder_minutes)
            .bind(&now)
            .bind(&now)
            .execute(&state.db)
            .await?;

            let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
                .bind(&id)
                .fetch_one(&state.db)
                .await?;
            tracing::info!(user_id = %user.id, "New business registered");
            (user, true)
        }
    };

    if !user.is_active() {
        return Err(AuthError::Inactive.into());
    }

    let auth = &state.config.auth;
    let token = issue_token(auth, &user.id, ROLE_OWNER)?;
    let jar = jar.add(session_cookie(auth, &auth.cookie_name, token));

    Ok((
        jar,
        Json(LoginResponse {
            user: user.into(),
            is_new,
        }),
    ))
}

/// POST /api/auth/logout
pub async fn logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> CookieJar {
    jar.remove(removal_cookie(&state.config.auth.cookie_name))
}

/// GET /api/auth/me
pub async fn me(AuthUser(user): AuthUser) -> Json<UserResponse> {
    Json(user.into())
}

/// POST /api/admin/auth/login
pub async fn admin_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<AdminLoginRequest>,
) -> Result<(CookieJar, Json<Admin>), ApiError> {
    let admin: Option<Admin> = sqlx::query_as("SELECT * FROM admins WHERE username = ?")
        .bind(req.username.trim())
        .fetch_optional(&state.db)
        .await?;

    let admin = match admin {
        Some(admin) if verify_password(&req.password, &admin.password_hash) => admin,
        _ => {
            tracing::warn!(username = %req.username, "Failed admin login");
            return Err(ApiError::unauthorized("Invalid username or password"));
        }
    };

    let auth = &state.config.auth;
    let token = issue_token(auth, &admin.id, ROLE_ADMIN)?;
    let jar = jar.add(session_cookie(auth, &auth.admin_cookie_name, token));
    tracing::info!(admin = %admin.username, "Admin logged in");

    Ok((jar, Json(admin)))
}

/// POST /api/admin/auth/logout
pub async fn admin_logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> CookieJar {
    jar.remove(removal_cookie(&state.config.auth.admin_cookie_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_and_verify() {
        let hash = hash_password("correct horse battery").unwrap();
        assert!(verify_password("correct horse battery", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("anything", "not-a-hash"));

        // Fresh salt per hash
        assert_ne!(hash, hash_password("correct horse battery").unwrap());
    }

    #[test]
    fn test_token_round_trip_and_tamper() {
        let config = AuthConfig::default();
        let token = issue_token(&config, "user-1", ROLE_OWNER).unwrap();
        let claims = verify_token(&config, &token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.role, ROLE_OWNER);
        assert!(claims.exp > claims.iat);

        let mut other = AuthConfig::default();
        other.jwt_secret = "another-secret".to_string();
        assert!(verify_token(&other, &token).is_err());
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let config = AuthConfig::default();
        let past = Utc::now() - Duration::hours(2);
        let claims = Claims {
            sub: "user-1".to_string(),
            role: ROLE_OWNER.to_string(),
            iat: past.timestamp(),
            exp: (past + Duration::minutes(5)).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .unwrap();
        assert!(matches!(
            verify_token(&config, &token),
            Err(AuthError::InvalidSession)
        ));
    }

    #[test]
    fn test_otp_format_and_hash() {
        for _ in 0..20 {
            let code = generate_otp();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
        assert_eq!(hash_code("123456"), hash_code("123456"));
        assert_ne!(hash_code("123456"), hash_code("123457"));
        assert_eq!(generate_token().len(), 32);
    }
}
