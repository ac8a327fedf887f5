//! HTTP client for the external tenant directory.
//!
//! The upstream wraps every reply in a `{code, message, data}` envelope and
//! signals several business conditions with non-zero codes. Callers never
//! branch on raw codes; they go through [`TenantApiResponse::classify_create`]
//! and [`TenantApiResponse::classify_bind`], which require the numeric code
//! and the message wording to agree before treating a reply as a known
//! condition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use subflow_shared::TenantApiConfig;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::error::{IdentityError, IdentityResult};

pub const CREATE_TENANT_PATH: &str = "/tenant/create";
pub const BIND_PASSWORD_PATH: &str = "/tenant/user/password/bind";
pub const SUBSCRIPTION_KEY_HEADER: &str = "X-Subscription-Key";

/// The single application activated for every provisioned tenant.
pub const DEFAULT_APP_ID: i64 = 1;

pub const CODE_SUCCESS: i64 = 0;
pub const CODE_ADMIN_ALREADY_REGISTERED: i64 = 1002;
pub const CODE_APP_NOT_ACTIVATED: i64 = 1005;
pub const CODE_PASSWORD_ALREADY_BOUND: i64 = 1010;

// The upstream serves localized messages; both wordings observed in
// production are accepted. Codes alone are not trusted because the vendor
// reuses them across unrelated conditions.
const ALREADY_REGISTERED_PATTERNS: &[&str] = &["已注册", "already registered"];
const ALREADY_BOUND_PATTERNS: &[&str] = &["已绑定", "already bound"];
const APP_NOT_ACTIVATED_PATTERNS: &[&str] = &["未激活", "not activated"];

const MAX_ERROR_BODY_CHARS: usize = 512;

/// Payload for `POST /tenant/create`. The registering user doubles as the
/// tenant administrator.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTenantRequest {
    pub name: String,
    pub region_code: String,
    pub admin_name: String,
    pub admin_email: String,
    pub admin_password: String,
    pub app_ids: Vec<i64>,
}

impl CreateTenantRequest {
    pub fn for_admin(name: &str, email: &str, password: &str, region_code: &str) -> Self {
        Self {
            name: name.to_string(),
            region_code: region_code.to_string(),
            admin_name: name.to_string(),
            admin_email: email.to_string(),
            admin_password: password.to_string(),
            app_ids: vec![DEFAULT_APP_ID],
        }
    }
}

/// Payload for `POST /tenant/user/password/bind`. The upstream requires the
/// `phone` field to be present even when empty.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindPasswordRequest {
    pub email: String,
    pub phone: String,
    pub new_password: String,
}

impl BindPasswordRequest {
    pub fn new(email: &str, new_password: &str) -> Self {
        Self {
            email: email.to_string(),
            phone: String::new(),
            new_password: new_password.to_string(),
        }
    }
}

/// The `{code, message, data}` envelope every tenant API reply uses.
#[derive(Debug, Clone, Deserialize)]
pub struct TenantApiResponse {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Outcome classes for a tenant-create reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateClass {
    Created,
    /// The admin email already owns a tenant upstream. Recoverable only if
    /// the reply still carries the tenant id.
    AlreadyRegistered,
    Rejected,
}

/// Outcome classes for a password-bind reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindClass {
    Bound,
    /// The credential is already bound; idempotent success.
    AlreadyBound,
    /// The tenant exists but its application was never activated. Retrying
    /// cannot help.
    AppNotActivated,
    Rejected,
}

impl TenantApiResponse {
    /// Extract `data.tenantId`, tolerating the numeric form some upstream
    /// versions emit. Empty strings count as absent.
    pub fn tenant_id(&self) -> Option<String> {
        match self.data.as_ref()?.get("tenantId")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn classify_create(&self) -> CreateClass {
        if self.code == CODE_SUCCESS {
            CreateClass::Created
        } else if self.code == CODE_ADMIN_ALREADY_REGISTERED
            && message_matches(&self.message, ALREADY_REGISTERED_PATTERNS)
        {
            CreateClass::AlreadyRegistered
        } else {
            CreateClass::Rejected
        }
    }

    pub fn classify_bind(&self) -> BindClass {
        if self.code == CODE_SUCCESS {
            BindClass::Bound
        } else if self.code == CODE_PASSWORD_ALREADY_BOUND
            && message_matches(&self.message, ALREADY_BOUND_PATTERNS)
        {
            BindClass::AlreadyBound
        } else if self.code == CODE_APP_NOT_ACTIVATED
            && message_matches(&self.message, APP_NOT_ACTIVATED_PATTERNS)
        {
            BindClass::AppNotActivated
        } else {
            BindClass::Rejected
        }
    }
}

fn message_matches(message: &str, patterns: &[&str]) -> bool {
    let lowered = message.to_lowercase();
    patterns.iter().any(|pattern| lowered.contains(pattern))
}

/// Transport seam for the tenant directory, mockable in tests.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn create_tenant(
        &self,
        request: &CreateTenantRequest,
    ) -> IdentityResult<TenantApiResponse>;

    async fn bind_password(
        &self,
        request: &BindPasswordRequest,
    ) -> IdentityResult<TenantApiResponse>;
}

/// Production client. Timeouts, retry count, and backoff come from
/// [`TenantApiConfig`]; only transport-level failures are retried, never
/// business rejections.
#[derive(Clone)]
pub struct HttpTenantDirectory {
    client: reqwest::Client,
    config: TenantApiConfig,
}

impl HttpTenantDirectory {
    pub fn new(config: TenantApiConfig) -> IdentityResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    async fn post_json<B>(&self, path: &str, body: &B) -> IdentityResult<TenantApiResponse>
    where
        B: Serialize + Sync,
    {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let backoff = FixedInterval::from_millis(self.config.retry_backoff_ms)
            .take(self.config.max_retries);

        RetryIf::spawn(
            backoff,
            || self.send_once(&url, body),
            |error: &IdentityError| {
                let transient = is_transient(error);
                if transient {
                    warn!(url = %url, error = %error, "Transient tenant API failure, retrying");
                }
                transient
            },
        )
        .await
    }

    async fn send_once<B>(&self, url: &str, body: &B) -> IdentityResult<TenantApiResponse>
    where
        B: Serialize + Sync,
    {
        let response = self
            .client
            .post(url)
            .header(SUBSCRIPTION_KEY_HEADER, self.config.subscription_key.as_str())
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IdentityError::UpstreamStatus {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        Ok(response.json::<TenantApiResponse>().await?)
    }
}

/// Connection and timeout failures plus server-side 5xx/429 statuses are
/// worth retrying; anything else is a definitive answer.
fn is_transient(error: &IdentityError) -> bool {
    match error {
        IdentityError::Http(e) => e.is_timeout() || e.is_connect(),
        IdentityError::UpstreamStatus { status, .. } => *status >= 500 || *status == 429,
        _ => false,
    }
}

#[async_trait]
impl TenantDirectory for HttpTenantDirectory {
    async fn create_tenant(
        &self,
        request: &CreateTenantRequest,
    ) -> IdentityResult<TenantApiResponse> {
        debug!(admin_email = %request.admin_email, "Creating tenant upstream");
        self.post_json(CREATE_TENANT_PATH, request).await
    }

    async fn bind_password(
        &self,
        request: &BindPasswordRequest,
    ) -> IdentityResult<TenantApiResponse> {
        debug!(email = %request.email, "Binding subscriber credential upstream");
        self.post_json(BIND_PASSWORD_PATH, request).await
    }
}
