//! In-memory doubles and fixture builders shared by the unit tests.
//!
//! `MemoryLedger` and `MemoryUserStore` mirror the contracts of the
//! Postgres implementations closely enough for decision-path tests;
//! `ScriptedDirectory` replays canned tenant API envelopes keyed by email.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use subflow_shared::{PlanTier, TenantApiConfig};

use crate::error::{IdentityError, IdentityResult};
use crate::gatekeeper::AttemptKeys;
use crate::ledger::{
    AttemptFilter, AttemptKey, AttemptLedger, AttemptStats, FingerprintAttempt, NewAttempt,
};
use crate::tenant_api::{
    BindPasswordRequest, CreateTenantRequest, TenantApiResponse, TenantDirectory,
    CODE_ADMIN_ALREADY_REGISTERED, CODE_APP_NOT_ACTIVATED, CODE_PASSWORD_ALREADY_BOUND,
    CODE_SUCCESS,
};
use crate::users::{NewUser, ProvisionLease, SyncUser, SyncUserStore};

pub(crate) fn attempt(ip: &str, email: Option<&str>) -> NewAttempt {
    NewAttempt {
        ip_address: ip.to_string(),
        user_agent: "test-agent".to_string(),
        device_signature: format!("fp1:device-for-{ip}"),
        fingerprint_id: None,
        email: email.map(str::to_string),
        payload: json!({}),
    }
}

pub(crate) fn new_attempt(keys: &AttemptKeys) -> NewAttempt {
    NewAttempt {
        ip_address: keys.ip.clone(),
        user_agent: "test-agent".to_string(),
        device_signature: keys.device_signature.clone(),
        fingerprint_id: keys.fingerprint_id.clone(),
        email: keys.email.clone(),
        payload: json!({}),
    }
}

pub(crate) fn test_tenant_config() -> TenantApiConfig {
    TenantApiConfig {
        base_url: "http://tenant.invalid".to_string(),
        subscription_key: "sk-test".to_string(),
        region_code: "86".to_string(),
        connect_timeout_secs: 1,
        request_timeout_secs: 1,
        max_retries: 0,
        retry_backoff_ms: 1,
    }
}

pub(crate) fn envelope(
    code: i64,
    message: &str,
    data: Option<serde_json::Value>,
) -> TenantApiResponse {
    TenantApiResponse {
        code,
        message: message.to_string(),
        data,
    }
}

pub(crate) fn success_envelope(tenant_id: &str) -> TenantApiResponse {
    envelope(CODE_SUCCESS, "success", Some(json!({ "tenantId": tenant_id })))
}

pub(crate) fn already_registered_envelope(tenant_id: Option<&str>) -> TenantApiResponse {
    envelope(
        CODE_ADMIN_ALREADY_REGISTERED,
        "该管理员已注册",
        tenant_id.map(|id| json!({ "tenantId": id })),
    )
}

pub(crate) fn already_bound_envelope() -> TenantApiResponse {
    envelope(CODE_PASSWORD_ALREADY_BOUND, "该账号已绑定密码", None)
}

pub(crate) fn app_not_activated_envelope() -> TenantApiResponse {
    envelope(CODE_APP_NOT_ACTIVATED, "应用未激活", None)
}

pub(crate) fn rejected_envelope(code: i64, message: &str) -> TenantApiResponse {
    envelope(code, message, None)
}

fn materialize(attempt: NewAttempt, created_at: OffsetDateTime) -> FingerprintAttempt {
    FingerprintAttempt {
        id: Uuid::new_v4(),
        ip_address: attempt.ip_address,
        user_agent: attempt.user_agent,
        device_signature: attempt.device_signature,
        fingerprint_id: attempt.fingerprint_id,
        email: attempt.email,
        blocked: false,
        blocked_at: None,
        block_reason: None,
        payload: attempt.payload,
        created_at,
    }
}

fn key_value(row: &FingerprintAttempt, key: AttemptKey) -> Option<&str> {
    match key {
        AttemptKey::Ip => Some(row.ip_address.as_str()),
        AttemptKey::Email => row.email.as_deref(),
        AttemptKey::DeviceSignature => Some(row.device_signature.as_str()),
        AttemptKey::FingerprintId => row.fingerprint_id.as_deref(),
    }
}

fn matches_filter(row: &FingerprintAttempt, filter: &AttemptFilter) -> bool {
    if let Some(ip) = &filter.ip {
        if &row.ip_address != ip {
            return false;
        }
    }
    if let Some(email) = &filter.email {
        if row.email.as_deref() != Some(email.as_str()) {
            return false;
        }
    }
    if let Some(days) = filter.days {
        if row.created_at < OffsetDateTime::now_utc() - Duration::days(days) {
            return false;
        }
    }
    true
}

pub(crate) struct MemoryLedger {
    rows: Mutex<Vec<FingerprintAttempt>>,
}

impl MemoryLedger {
    pub(crate) fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
        }
    }

    /// Append a row with an explicit timestamp, for window tests.
    pub(crate) fn push_at(&self, attempt: NewAttempt, created_at: OffsetDateTime) {
        self.rows
            .lock()
            .unwrap()
            .push(materialize(attempt, created_at));
    }
}

#[async_trait]
impl AttemptLedger for MemoryLedger {
    async fn record(&self, attempt: NewAttempt) -> IdentityResult<FingerprintAttempt> {
        let row = materialize(attempt, OffsetDateTime::now_utc());
        self.rows.lock().unwrap().push(row.clone());
        Ok(row)
    }

    async fn find_by_key(
        &self,
        key: AttemptKey,
        value: &str,
    ) -> IdentityResult<Vec<FingerprintAttempt>> {
        let mut rows: Vec<FingerprintAttempt> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| key_value(row, key) == Some(value))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn count_recent(
        &self,
        key: AttemptKey,
        value: &str,
        window_days: i64,
    ) -> IdentityResult<i64> {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(window_days);
        let count = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| key_value(row, key) == Some(value) && row.created_at >= cutoff)
            .count();
        Ok(count as i64)
    }

    async fn any_blocked(&self, key: AttemptKey, value: &str) -> IdentityResult<bool> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .any(|row| key_value(row, key) == Some(value) && row.blocked))
    }

    async fn block(&self, key: AttemptKey, value: &str, reason: &str) -> IdentityResult<u64> {
        let now = OffsetDateTime::now_utc();
        let mut blocked = 0;
        for row in self.rows.lock().unwrap().iter_mut() {
            if key_value(row, key) == Some(value) && !row.blocked {
                row.blocked = true;
                row.blocked_at = Some(now);
                row.block_reason = Some(reason.to_string());
                blocked += 1;
            }
        }
        Ok(blocked)
    }

    async fn unblock(&self, key: AttemptKey, value: &str) -> IdentityResult<u64> {
        let mut cleared = 0;
        for row in self.rows.lock().unwrap().iter_mut() {
            if key_value(row, key) == Some(value) && row.blocked {
                row.blocked = false;
                row.blocked_at = None;
                row.block_reason = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn list(&self, filter: &AttemptFilter) -> IdentityResult<Vec<FingerprintAttempt>> {
        let mut rows: Vec<FingerprintAttempt> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| matches_filter(row, filter))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }

    async fn stats(&self, filter: &AttemptFilter) -> IdentityResult<AttemptStats> {
        let rows = self.rows.lock().unwrap();
        let selected: Vec<&FingerprintAttempt> =
            rows.iter().filter(|row| matches_filter(row, filter)).collect();

        let mut ips = HashSet::new();
        let mut emails = HashSet::new();
        let mut devices = HashSet::new();
        let mut blocked = 0_i64;
        for row in &selected {
            ips.insert(row.ip_address.as_str());
            if let Some(email) = row.email.as_deref() {
                emails.insert(email);
            }
            devices.insert(row.device_signature.as_str());
            if row.blocked {
                blocked += 1;
            }
        }

        Ok(AttemptStats {
            total_attempts: selected.len() as i64,
            blocked_attempts: blocked,
            distinct_ips: ips.len() as i64,
            distinct_emails: emails.len() as i64,
            distinct_devices: devices.len() as i64,
        })
    }

    async fn purge_older_than(&self, days: i64) -> IdentityResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(days);
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|row| row.created_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}

struct MemoryOrder {
    user_id: Uuid,
    plan_tier: PlanTier,
    status: String,
}

pub(crate) struct MemoryUserStore {
    rows: Arc<Mutex<Vec<SyncUser>>>,
    orders: Arc<Mutex<Vec<MemoryOrder>>>,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl MemoryUserStore {
    pub(crate) fn new() -> Self {
        Self {
            rows: Arc::new(Mutex::new(Vec::new())),
            orders: Arc::new(Mutex::new(Vec::new())),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub(crate) fn seed_user(
        &self,
        email: &str,
        subscriber_password: Option<&str>,
        tenant_id: Option<&str>,
        status: i32,
    ) -> SyncUser {
        let now = OffsetDateTime::now_utc();
        let user = SyncUser {
            id: Uuid::new_v4(),
            name: email.split('@').next().unwrap_or("user").to_string(),
            email: email.to_string(),
            subscriber_password: subscriber_password.map(str::to_string),
            tenant_id: tenant_id.map(str::to_string),
            has_used_free_plan: false,
            free_plan_used_at: None,
            last_ip: None,
            last_device_fingerprint: None,
            last_login_at: None,
            status,
            created_at: now,
            updated_at: now,
        };
        self.rows.lock().unwrap().push(user.clone());
        user
    }

    pub(crate) fn set_free_plan_used(&self, user_id: Uuid) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|u| u.id == user_id) {
            row.has_used_free_plan = true;
            row.free_plan_used_at = Some(OffsetDateTime::now_utc());
        }
    }

    pub(crate) fn add_order(&self, user_id: Uuid, plan_tier: PlanTier, status: &str) {
        self.orders.lock().unwrap().push(MemoryOrder {
            user_id,
            plan_tier,
            status: status.to_string(),
        });
    }

    pub(crate) fn add_completed_paid_order(&self, user_id: Uuid) {
        self.add_order(user_id, PlanTier::Starter, "completed");
    }
}

fn select_candidates(
    rows: &Mutex<Vec<SyncUser>>,
    limit: Option<i64>,
    email: Option<&str>,
    require_tenant: bool,
) -> Vec<SyncUser> {
    let rows = rows.lock().unwrap();
    let mut selected: Vec<SyncUser> = rows
        .iter()
        .filter(|u| u.tenant_id.is_some() == require_tenant)
        .filter(|u| u.subscriber_password.is_some())
        .filter(|u| u.status >= 0)
        .filter(|u| email.map_or(true, |e| u.email == e))
        .cloned()
        .collect();
    selected.sort_by_key(|u| u.created_at);
    if let Some(limit) = limit {
        selected.truncate(limit.max(0) as usize);
    }
    selected
}

#[async_trait]
impl SyncUserStore for MemoryUserStore {
    async fn create_user(&self, new_user: NewUser) -> IdentityResult<SyncUser> {
        let mut rows = self.rows.lock().unwrap();
        if rows.iter().any(|u| u.email == new_user.email) {
            return Err(IdentityError::Invariant("duplicate email"));
        }
        let now = OffsetDateTime::now_utc();
        let user = SyncUser {
            id: Uuid::new_v4(),
            name: new_user.name,
            email: new_user.email,
            subscriber_password: new_user.subscriber_password,
            tenant_id: None,
            has_used_free_plan: false,
            free_plan_used_at: None,
            last_ip: None,
            last_device_fingerprint: None,
            last_login_at: None,
            status: 0,
            created_at: now,
            updated_at: now,
        };
        rows.push(user.clone());
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> IdentityResult<Option<SyncUser>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> IdentityResult<Option<SyncUser>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|u| u.id == id)
            .cloned())
    }

    async fn lock_for_provisioning(
        &self,
        email: &str,
    ) -> IdentityResult<Option<Box<dyn ProvisionLease>>> {
        let mutex = {
            let mut locks = self.locks.lock().unwrap();
            locks
                .entry(email.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = mutex.lock_owned().await;

        // Snapshot after the lock so a prior holder's commit is visible
        let user = {
            let rows = self.rows.lock().unwrap();
            rows.iter().find(|u| u.email == email).cloned()
        };
        match user {
            Some(user) => Ok(Some(Box::new(MemoryLease {
                rows: self.rows.clone(),
                user,
                pending: None,
                guard: Some(guard),
            }))),
            None => Ok(None),
        }
    }

    async fn mark_free_plan_used(&self, user_id: Uuid) -> IdentityResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows
            .iter_mut()
            .find(|u| u.id == user_id && !u.has_used_free_plan)
        {
            row.has_used_free_plan = true;
            row.free_plan_used_at = Some(OffsetDateTime::now_utc());
            row.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn touch_last_seen(
        &self,
        user_id: Uuid,
        ip: &str,
        device_fingerprint: &str,
    ) -> IdentityResult<()> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|u| u.id == user_id) {
            row.last_ip = Some(ip.to_string());
            row.last_device_fingerprint = Some(device_fingerprint.to_string());
            row.last_login_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn has_completed_paid_order(&self, user_id: Uuid) -> IdentityResult<bool> {
        Ok(self.orders.lock().unwrap().iter().any(|order| {
            order.user_id == user_id && order.status == "completed" && !order.plan_tier.is_free()
        }))
    }

    async fn tenant_backfill_candidates(
        &self,
        limit: Option<i64>,
        email: Option<&str>,
    ) -> IdentityResult<Vec<SyncUser>> {
        Ok(select_candidates(&self.rows, limit, email, false))
    }

    async fn bind_backfill_candidates(
        &self,
        limit: Option<i64>,
        email: Option<&str>,
    ) -> IdentityResult<Vec<SyncUser>> {
        Ok(select_candidates(&self.rows, limit, email, true))
    }
}

/// Memory analogue of the row lease: pending writes land at commit, and a
/// drop without commit discards them.
struct MemoryLease {
    rows: Arc<Mutex<Vec<SyncUser>>>,
    user: SyncUser,
    pending: Option<String>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

#[async_trait]
impl ProvisionLease for MemoryLease {
    fn user(&self) -> &SyncUser {
        &self.user
    }

    async fn persist_tenant_id(&mut self, tenant_id: &str) -> IdentityResult<()> {
        if self.guard.is_none() {
            return Err(IdentityError::Invariant("provisioning lease already closed"));
        }
        if let Some(existing) = &self.user.tenant_id {
            if existing == tenant_id {
                return Ok(());
            }
            return Err(IdentityError::TenantIdConflict {
                user_id: self.user.id,
                existing: existing.clone(),
                attempted: tenant_id.to_string(),
            });
        }
        self.user.tenant_id = Some(tenant_id.to_string());
        self.pending = Some(tenant_id.to_string());
        Ok(())
    }

    async fn commit(&mut self) -> IdentityResult<()> {
        if let Some(tenant_id) = self.pending.take() {
            let mut rows = self.rows.lock().unwrap();
            if let Some(row) = rows.iter_mut().find(|u| u.id == self.user.id) {
                row.tenant_id = Some(tenant_id);
                row.updated_at = OffsetDateTime::now_utc();
            }
        }
        self.guard = None;
        Ok(())
    }
}

pub(crate) enum ScriptedReply {
    Envelope(TenantApiResponse),
    HttpStatus(u16),
}

/// Tenant directory double. Replies are scripted per email and consumed in
/// order; unscripted calls succeed with a generated tenant id.
pub(crate) struct ScriptedDirectory {
    create_script: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    bind_script: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    create_count: AtomicUsize,
    bind_count: AtomicUsize,
    generated: AtomicUsize,
}

impl ScriptedDirectory {
    pub(crate) fn new() -> Self {
        Self {
            create_script: Mutex::new(HashMap::new()),
            bind_script: Mutex::new(HashMap::new()),
            create_count: AtomicUsize::new(0),
            bind_count: AtomicUsize::new(0),
            generated: AtomicUsize::new(0),
        }
    }

    pub(crate) fn on_create(&self, email: &str, reply: ScriptedReply) {
        self.create_script
            .lock()
            .unwrap()
            .entry(email.to_string())
            .or_default()
            .push_back(reply);
    }

    pub(crate) fn on_bind(&self, email: &str, reply: ScriptedReply) {
        self.bind_script
            .lock()
            .unwrap()
            .entry(email.to_string())
            .or_default()
            .push_back(reply);
    }

    pub(crate) fn create_calls(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    pub(crate) fn bind_calls(&self) -> usize {
        self.bind_count.load(Ordering::SeqCst)
    }

    fn next_reply(
        script: &Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
        email: &str,
    ) -> Option<ScriptedReply> {
        script
            .lock()
            .unwrap()
            .get_mut(email)
            .and_then(VecDeque::pop_front)
    }

    fn resolve(
        reply: Option<ScriptedReply>,
        default: TenantApiResponse,
    ) -> IdentityResult<TenantApiResponse> {
        match reply {
            Some(ScriptedReply::Envelope(envelope)) => Ok(envelope),
            Some(ScriptedReply::HttpStatus(status)) => Err(IdentityError::UpstreamStatus {
                status,
                body: format!("scripted {status}"),
            }),
            None => Ok(default),
        }
    }
}

#[async_trait]
impl TenantDirectory for ScriptedDirectory {
    async fn create_tenant(
        &self,
        request: &CreateTenantRequest,
    ) -> IdentityResult<TenantApiResponse> {
        self.create_count.fetch_add(1, Ordering::SeqCst);
        let reply = Self::next_reply(&self.create_script, &request.admin_email);
        let n = self.generated.fetch_add(1, Ordering::SeqCst) + 1;
        Self::resolve(reply, success_envelope(&format!("t-{n}")))
    }

    async fn bind_password(
        &self,
        request: &BindPasswordRequest,
    ) -> IdentityResult<TenantApiResponse> {
        self.bind_count.fetch_add(1, Ordering::SeqCst);
        let reply = Self::next_reply(&self.bind_script, &request.email);
        Self::resolve(reply, success_envelope("t-bind"))
    }
}
