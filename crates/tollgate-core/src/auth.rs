//! Authentication and authorization.
//!
//! Roles expand to a fixed capability set at compile time — capabilities
//! are never carried in tokens as mutable state. A bearer token holds the
//! role authoritatively; verification reconstructs the capability set from
//! the role and collapses unknown role strings to `observer`, the safe
//! default.
//!
//! Login is guarded by a per-(principal, client IP) lockout counter in the
//! KV store. Past the attempt threshold every login fails fast until the
//! window expires — verification is not even attempted. The password hash
//! comparison runs against a fixed dummy hash when the user is unknown, so
//! login latency does not reveal which usernames exist.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use tollgate_store::KvStore;

use crate::audit::{AuditEvent, AuditManager};
use crate::error::AuthError;
use crate::token::TokenSigner;
use crate::users::UserDirectory;

/// A fine-grained, dotted permission token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    EscalationView,
    EscalationResolve,
    TaskCreate,
    TaskUpdate,
    TaskView,
    AgentView,
    BudgetView,
    LearningView,
    MetricsView,
    DlqRead,
    SystemAdmin,
}

impl Capability {
    /// Every capability, in declaration order. This is what `admin` gets.
    pub const ALL: &'static [Self] = &[
        Self::EscalationView,
        Self::EscalationResolve,
        Self::TaskCreate,
        Self::TaskUpdate,
        Self::TaskView,
        Self::AgentView,
        Self::BudgetView,
        Self::LearningView,
        Self::MetricsView,
        Self::DlqRead,
        Self::SystemAdmin,
    ];

    /// The dotted wire form, e.g. `budget.view`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EscalationView => "escalation.view",
            Self::EscalationResolve => "escalation.resolve",
            Self::TaskCreate => "task.create",
            Self::TaskUpdate => "task.update",
            Self::TaskView => "task.view",
            Self::AgentView => "agent.view",
            Self::BudgetView => "budget.view",
            Self::LearningView => "learning.view",
            Self::MetricsView => "metrics.view",
            Self::DlqRead => "dlq.read",
            Self::SystemAdmin => "system.admin",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const OPERATOR_CAPS: &[Capability] = &[
    Capability::EscalationView,
    Capability::EscalationResolve,
    Capability::TaskCreate,
    Capability::TaskUpdate,
    Capability::TaskView,
    Capability::AgentView,
    Capability::BudgetView,
    Capability::LearningView,
    Capability::MetricsView,
];

const DEVELOPER_CAPS: &[Capability] = &[
    Capability::TaskCreate,
    Capability::TaskUpdate,
    Capability::TaskView,
    Capability::AgentView,
    Capability::MetricsView,
];

const OBSERVER_CAPS: &[Capability] = &[
    Capability::TaskView,
    Capability::AgentView,
    Capability::MetricsView,
];

/// A principal's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Operator,
    Developer,
    Observer,
}

impl Role {
    /// Wire form of the role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Operator => "operator",
            Self::Developer => "developer",
            Self::Observer => "observer",
        }
    }

    /// Parse a role from a token or database string.
    ///
    /// Unknown roles collapse to [`Role::Observer`]: a token minted before
    /// a role was removed must degrade to the least-privileged set, never
    /// fail open.
    #[must_use]
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "admin" => Self::Admin,
            "operator" => Self::Operator,
            "developer" => Self::Developer,
            _ => Self::Observer,
        }
    }

    /// The fixed capability set for this role.
    #[must_use]
    pub fn capabilities(self) -> &'static [Capability] {
        match self {
            Self::Admin => Capability::ALL,
            Self::Operator => OPERATOR_CAPS,
            Self::Developer => DEVELOPER_CAPS,
            Self::Observer => OBSERVER_CAPS,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A verified caller.
///
/// Produced only by [`Authenticator::verify`]; handlers receive it through
/// request extensions and gate privileged operations with
/// [`Principal::authorize`].
#[derive(Debug, Clone)]
pub struct Principal {
    /// Lowercased username.
    pub id: String,
    /// Role from the verified token.
    pub role: Role,
}

impl Principal {
    /// The expanded capability set.
    #[must_use]
    pub fn capabilities(&self) -> &'static [Capability] {
        self.role.capabilities()
    }

    /// Check this principal holds a capability.
    #[must_use]
    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities().contains(&cap)
    }

    /// Require every listed capability.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Forbidden`] listing the missing capabilities.
    pub fn authorize(&self, required: &[Capability]) -> Result<(), AuthError> {
        let missing: Vec<Capability> = required
            .iter()
            .copied()
            .filter(|cap| !self.has(*cap))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AuthError::Forbidden { missing })
        }
    }
}

/// Lockout and hashing knobs.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Failed attempts before logins fail fast.
    pub max_attempts: i64,
    /// Lockout window; also the TTL of the attempt counter.
    pub lockout_ttl: Duration,
    /// bcrypt work factor for newly hashed passwords.
    pub bcrypt_cost: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_ttl: Duration::from_secs(900),
            bcrypt_cost: 12,
        }
    }
}

/// Outcome of a successful login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// Signed bearer token.
    pub token: String,
    /// Authenticated role.
    pub role: Role,
}

/// A fixed bcrypt hash verified when the user is unknown, keeping login
/// latency uniform so usernames cannot be enumerated by timing.
const DUMMY_HASH: &str = "$2b$12$LQv3c1yqBWVHxkd0LHAkCOYz6TtxMQJqhN8/LewY5GyYqExt7YD3a";

/// Credential verification, token verification, and capability checks.
pub struct Authenticator {
    kv: Arc<dyn KvStore>,
    users: Arc<dyn UserDirectory>,
    signer: TokenSigner,
    audit: Arc<AuditManager>,
    config: AuthConfig,
}

impl Authenticator {
    /// Create a new authenticator.
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        users: Arc<dyn UserDirectory>,
        signer: TokenSigner,
        audit: Arc<AuditManager>,
        config: AuthConfig,
    ) -> Self {
        Self {
            kv,
            users,
            signer,
            audit,
            config,
        }
    }

    /// Verify a username/password pair and mint a bearer token.
    ///
    /// The lockout counter is incremented before anything else and is an
    /// absorbing failure state: past the threshold, verification is not
    /// attempted until the window expires. The counter is cleared only on
    /// a successful verify.
    ///
    /// # Errors
    ///
    /// - [`AuthError::RateLimited`] past the attempt threshold.
    /// - [`AuthError::InvalidCredentials`] for unknown user or bad password.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        client_ip: &str,
    ) -> Result<LoginOutcome, AuthError> {
        let principal_id = username.trim().to_lowercase();
        let counter_key = format!("login:attempts:{principal_id}:{client_ip}");

        let attempts = self.kv.incr(&counter_key).await?;
        if attempts == 1 {
            // TTL only on first hit so repeated attempts do not extend
            // the window.
            self.kv.expire(&counter_key, self.config.lockout_ttl).await?;
        }

        if attempts > self.config.max_attempts {
            let remaining = self
                .kv
                .ttl(&counter_key)
                .await?
                .unwrap_or(self.config.lockout_ttl);
            let minutes = remaining.as_secs().div_ceil(60).max(1);
            warn!(principal = %principal_id, client_ip, attempts, "login locked out");
            return Err(AuthError::RateLimited { minutes });
        }

        let user = self.users.find(&principal_id).await?;

        // Always run the hash comparison, even for unknown users.
        let stored_hash = user
            .as_ref()
            .map_or_else(|| DUMMY_HASH.to_owned(), |u| u.password_hash.clone());
        let password_ok = verify_password(password.to_owned(), stored_hash).await?;

        let Some(user) = user else {
            self.audit_login_fail(&principal_id, client_ip, "user_not_found").await;
            return Err(AuthError::InvalidCredentials);
        };

        if !password_ok {
            self.audit_login_fail(&principal_id, client_ip, "invalid_password").await;
            return Err(AuthError::InvalidCredentials);
        }

        self.kv.delete(&counter_key).await?;
        let token = self.signer.mint(&principal_id, user.role)?;

        self.audit
            .log(AuditEvent::new(
                &principal_id,
                Some(user.role),
                "auth.login.success",
                "auth",
                &principal_id,
                json!({ "client_ip": client_ip }),
            ))
            .await;
        info!(principal = %principal_id, role = %user.role, "login succeeded");

        Ok(LoginOutcome {
            token,
            role: user.role,
        })
    }

    /// Verify a bearer token and reconstruct the principal.
    ///
    /// Capabilities are expanded from the role here — anything embedded in
    /// the token payload is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenExpired`] or [`AuthError::TokenInvalid`].
    pub fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let claims = self.signer.verify(token)?;
        Ok(Principal {
            id: claims.sub,
            role: Role::from_str_lossy(&claims.role),
        })
    }

    async fn audit_login_fail(&self, principal_id: &str, client_ip: &str, reason: &str) {
        self.audit
            .log(AuditEvent::new(
                principal_id,
                None,
                "auth.login.fail",
                "auth",
                principal_id,
                json!({ "reason": reason, "client_ip": client_ip }),
            ))
            .await;
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Verify a password against a bcrypt hash off the async scheduler.
async fn verify_password(password: String, hash: String) -> Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .map_err(|e| AuthError::Hash {
            reason: e.to_string(),
        })?
        .map_err(|e| AuthError::Hash {
            reason: e.to_string(),
        })
}

/// Hash a password with bcrypt off the async scheduler.
///
/// # Errors
///
/// Returns [`AuthError::Hash`] if hashing fails.
pub async fn hash_password(password: String, cost: u32) -> Result<String, AuthError> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .map_err(|e| AuthError::Hash {
            reason: e.to_string(),
        })?
        .map_err(|e| AuthError::Hash {
            reason: e.to_string(),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::users::MemoryUserDirectory;
    use tollgate_store::MemoryKv;

    const TEST_COST: u32 = 4; // bcrypt minimum, fast enough for tests

    async fn make_auth() -> (Authenticator, Arc<MemoryAuditSink>) {
        let kv = Arc::new(MemoryKv::new());
        let users = Arc::new(MemoryUserDirectory::new());
        let hash = hash_password("admin123".to_owned(), TEST_COST).await.unwrap();
        users.add("admin", &hash, Role::Admin).await;

        let audit = Arc::new(AuditManager::new());
        let sink = Arc::new(MemoryAuditSink::new());
        audit.add_sink(Arc::clone(&sink) as _).await;

        let signer = TokenSigner::new(b"test-secret", Duration::from_secs(86_400));
        let auth = Authenticator::new(
            kv,
            users,
            signer,
            audit,
            AuthConfig {
                bcrypt_cost: TEST_COST,
                ..AuthConfig::default()
            },
        );
        (auth, sink)
    }

    #[test]
    fn role_capability_mapping_is_fixed() {
        assert_eq!(Role::Admin.capabilities(), Capability::ALL);
        assert!(Role::Operator.capabilities().contains(&Capability::BudgetView));
        assert!(!Role::Developer.capabilities().contains(&Capability::BudgetView));
        assert_eq!(
            Role::Observer.capabilities(),
            &[Capability::TaskView, Capability::AgentView, Capability::MetricsView]
        );
        assert!(!Role::Observer.capabilities().contains(&Capability::SystemAdmin));
    }

    #[test]
    fn unknown_role_collapses_to_observer() {
        assert_eq!(Role::from_str_lossy("superuser"), Role::Observer);
        assert_eq!(Role::from_str_lossy(""), Role::Observer);
        assert_eq!(Role::from_str_lossy("operator"), Role::Operator);
    }

    #[test]
    fn authorize_reports_missing_capabilities() {
        let p = Principal {
            id: "dev".to_owned(),
            role: Role::Developer,
        };
        p.authorize(&[Capability::TaskView]).unwrap();

        let err = p
            .authorize(&[Capability::BudgetView, Capability::SystemAdmin])
            .unwrap_err();
        match err {
            AuthError::Forbidden { missing } => {
                assert_eq!(missing, vec![Capability::BudgetView, Capability::SystemAdmin]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn login_success_mints_verifiable_token() {
        let (auth, sink) = make_auth().await;
        let outcome = auth.login("Admin", "admin123", "1.2.3.4").await.unwrap();
        assert_eq!(outcome.role, Role::Admin);

        // Username was normalised before going into the token.
        let principal = auth.verify(&outcome.token).unwrap();
        assert_eq!(principal.id, "admin");
        assert_eq!(principal.role, Role::Admin);

        assert_eq!(sink.count_action("auth.login.success").await, 1);
    }

    #[tokio::test]
    async fn wrong_password_is_invalid_credentials() {
        let (auth, sink) = make_auth().await;
        let err = auth.login("admin", "nope", "1.2.3.4").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        assert_eq!(sink.count_action("auth.login.fail").await, 1);
    }

    #[tokio::test]
    async fn unknown_user_is_indistinguishable_from_wrong_password() {
        let (auth, _sink) = make_auth().await;
        let err = auth.login("ghost", "whatever", "1.2.3.4").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn lockout_after_threshold_is_absorbing() {
        let (auth, _sink) = make_auth().await;

        for _ in 0..5 {
            let err = auth.login("admin", "wrong", "9.9.9.9").await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials));
        }

        // Sixth and later attempts fail fast, even with the right password.
        let err = auth.login("admin", "wrong", "9.9.9.9").await.unwrap_err();
        let AuthError::RateLimited { minutes } = err else {
            panic!("expected rate limit, got {err}");
        };
        assert_eq!(minutes, 15);

        let err = auth.login("admin", "admin123", "9.9.9.9").await.unwrap_err();
        assert!(matches!(err, AuthError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn lockout_is_scoped_to_client_ip() {
        let (auth, _sink) = make_auth().await;
        for _ in 0..6 {
            let _ = auth.login("admin", "wrong", "1.1.1.1").await;
        }
        // A different IP is unaffected.
        auth.login("admin", "admin123", "2.2.2.2").await.unwrap();
    }

    #[tokio::test]
    async fn successful_login_clears_the_counter() {
        let (auth, _sink) = make_auth().await;
        for _ in 0..4 {
            let _ = auth.login("admin", "wrong", "3.3.3.3").await;
        }
        auth.login("admin", "admin123", "3.3.3.3").await.unwrap();

        // Counter was cleared: four more bad attempts stay under threshold.
        for _ in 0..4 {
            let err = auth.login("admin", "wrong", "3.3.3.3").await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials));
        }
    }

    #[tokio::test]
    async fn token_with_unknown_role_verifies_as_observer() {
        let (auth, _sink) = make_auth().await;
        let signer = TokenSigner::new(b"test-secret", Duration::from_secs(3600));
        let token = signer.mint_with_role_str("someone", "wizard").unwrap();

        let principal = auth.verify(&token).unwrap();
        assert_eq!(principal.role, Role::Observer);
    }
}
