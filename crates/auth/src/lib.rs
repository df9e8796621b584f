//! Supabase Auth (GoTrue) client for SmartMark
//!
//! Covers the parts of GoTrue a browser-less front-end needs: building the
//! OAuth authorize URL with a PKCE challenge, exchanging the returned code
//! for a session, refreshing and validating that session, and logging out.
//!
//! The client is stateless. Whoever calls it owns the session.

pub mod pkce;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::{debug, info, warn};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub use pkce::PkcePair;

/// エラー型
#[derive(Error, Debug)]
pub enum AuthError {
    /// GoTrue answered with a non-success status.
    #[error("API error ({status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

impl AuthError {
    /// True when the provider itself refused the request, as opposed to
    /// the request never reaching it.
    pub fn is_rejection(&self) -> bool {
        matches!(self, AuthError::ApiError { .. } | AuthError::AuthenticationError(_))
    }
}

/// ユーザー情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub app_metadata: serde_json::Value,
    #[serde(default)]
    pub user_metadata: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl User {
    /// `full_name` / `name` from the OAuth profile, falling back to the email.
    pub fn display_name(&self) -> Option<&str> {
        ["full_name", "name"]
            .iter()
            .find_map(|key| self.user_metadata.get(key).and_then(|v| v.as_str()))
            .or(self.email.as_deref())
    }
}

/// セッション情報
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    /// Unix seconds. Older GoTrue versions omit it; see [`Session::expires_at`].
    #[serde(default, rename = "expires_at")]
    pub expires_at_field: Option<i64>,
    pub token_type: String,
    pub user: User,
}

/// Claims read from the access token. The signature is not checked here;
/// GoTrue does that whenever the token is presented.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl Session {
    pub fn claims(&self) -> Result<AccessTokenClaims, AuthError> {
        decode_claims(&self.access_token)
    }

    /// アクセストークンの有効期限 (unix秒)
    pub fn expires_at(&self) -> Option<i64> {
        self.expires_at_field
            .or_else(|| self.claims().ok().map(|claims| claims.exp))
    }

    /// True when the token expires within `margin_secs` of `now`.
    /// A session with no readable expiry is treated as expired.
    pub fn expires_within(&self, margin_secs: i64, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires_at) => expires_at - margin_secs <= now.timestamp(),
            None => true,
        }
    }
}

pub fn decode_claims(token: &str) -> Result<AccessTokenClaims, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<AccessTokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
}

/// OAuth プロバイダ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OAuthProvider {
    Google,
}

impl OAuthProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
        }
    }
}

/// OAuth サインイン設定
#[derive(Debug, Clone, Default)]
pub struct OAuthSignInOptions {
    pub redirect_to: Option<String>,
    /// PKCE challenge; when set the callback carries `?code=` instead of tokens.
    pub code_challenge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoTrueErrorBody {
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Auth クライアント
#[derive(Debug, Clone)]
pub struct AuthClient {
    url: String,
    key: String,
    http_client: Client,
}

impl AuthClient {
    /// 新しい Auth クライアントを作成
    pub fn new(url: &str, key: &str, http_client: Client) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            http_client,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.url, path)
    }

    /// OAuthサインインURLを取得
    pub fn get_oauth_sign_in_url(
        &self,
        provider: OAuthProvider,
        options: OAuthSignInOptions,
    ) -> Result<String, AuthError> {
        let mut url = Url::parse(&self.endpoint("authorize"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("provider", provider.as_str());
            if let Some(redirect_to) = &options.redirect_to {
                query.append_pair("redirect_to", redirect_to);
            }
            if let Some(challenge) = &options.code_challenge {
                query.append_pair("code_challenge", challenge);
                query.append_pair("code_challenge_method", pkce::CHALLENGE_METHOD);
            }
        }
        Ok(url.into())
    }

    /// OAuthコールバックのコードをセッションに交換 (PKCE)
    pub async fn exchange_code_for_session(
        &self,
        auth_code: &str,
        code_verifier: &str,
    ) -> Result<Session, AuthError> {
        let payload = serde_json::json!({
            "auth_code": auth_code,
            "code_verifier": code_verifier,
        });

        let response = self
            .http_client
            .post(self.endpoint("token?grant_type=pkce"))
            .header("apikey", &self.key)
            .json(&payload)
            .send()
            .await?;

        let session: Session = check(response).await?.json().await?;
        info!("Exchanged auth code for session of user {}", session.user.id);
        Ok(session)
    }

    /// セッションをリフレッシュ
    pub async fn refresh_session(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let payload = serde_json::json!({ "refresh_token": refresh_token });

        let response = self
            .http_client
            .post(self.endpoint("token?grant_type=refresh_token"))
            .header("apikey", &self.key)
            .json(&payload)
            .send()
            .await?;

        let session: Session = check(response).await?.json().await?;
        debug!("Refreshed session of user {}", session.user.id);
        Ok(session)
    }

    /// 現在のユーザーを取得
    pub async fn get_user(&self, access_token: &str) -> Result<User, AuthError> {
        let response = self
            .http_client
            .get(self.endpoint("user"))
            .header("apikey", &self.key)
            .bearer_auth(access_token)
            .send()
            .await?;

        Ok(check(response).await?.json().await?)
    }

    /// サインアウト
    ///
    /// A token GoTrue no longer knows (401, 403, 404) is already signed out.
    pub async fn sign_out(&self, access_token: &str) -> Result<(), AuthError> {
        let response = self
            .http_client
            .post(self.endpoint("logout"))
            .header("apikey", &self.key)
            .bearer_auth(access_token)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                warn!("Logout returned {}; treating session as already ended", response.status());
                Ok(())
            }
            _ => check(response).await.map(|_| ()),
        }
    }
}

async fn check(response: Response) -> Result<Response, AuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await?;
    let message = serde_json::from_str::<GoTrueErrorBody>(&text)
        .ok()
        .and_then(|body| {
            body.error_description
                .or(body.msg)
                .or(body.message)
                .or(body.error)
        })
        .unwrap_or(text);

    Err(AuthError::ApiError {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn token_with_exp(exp: i64) -> String {
        encode(
            &Header::default(),
            &json!({ "sub": "user-1", "exp": exp, "role": "authenticated" }),
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap()
    }

    fn session(access_token: String, expires_at: Option<i64>) -> Session {
        Session {
            access_token,
            refresh_token: "refresh".to_string(),
            expires_in: 3600,
            expires_at_field: expires_at,
            token_type: "bearer".to_string(),
            user: User {
                id: "user-1".to_string(),
                email: Some("a@example.com".to_string()),
                app_metadata: json!({}),
                user_metadata: json!({}),
                created_at: None,
            },
        }
    }

    #[test]
    fn test_oauth_sign_in_url() {
        let auth = AuthClient::new("https://example.supabase.co/", "test-key", Client::new());

        let url = auth
            .get_oauth_sign_in_url(
                OAuthProvider::Google,
                OAuthSignInOptions {
                    redirect_to: Some("http://localhost:3000/auth/callback".to_string()),
                    code_challenge: Some("abc".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(url.starts_with("https://example.supabase.co/auth/v1/authorize?provider=google"));
        assert!(url.contains("redirect_to=http%3A%2F%2Flocalhost%3A3000%2Fauth%2Fcallback"));
        assert!(url.contains("code_challenge=abc&code_challenge_method=s256"));
    }

    #[test]
    fn expiry_falls_back_to_token_claims() {
        let s = session(token_with_exp(1_700_000_000), None);
        assert_eq!(s.expires_at(), Some(1_700_000_000));
        assert_eq!(s.claims().unwrap().sub, "user-1");
    }

    #[test]
    fn expires_within_margin() {
        let now = Utc::now();
        let s = session("not-a-jwt".to_string(), Some(now.timestamp() + 30));

        assert!(s.expires_within(60, now));
        assert!(!s.expires_within(10, now));
    }

    #[test]
    fn unreadable_expiry_counts_as_expired() {
        let s = session("not-a-jwt".to_string(), None);
        assert!(s.expires_within(0, Utc::now()));
    }

    #[test]
    fn display_name_prefers_profile_name() {
        let mut s = session("t".to_string(), None);
        assert_eq!(s.user.display_name(), Some("a@example.com"));

        s.user.user_metadata = json!({ "full_name": "Ada Lovelace" });
        assert_eq!(s.user.display_name(), Some("Ada Lovelace"));
    }
}
