//! Authorization gate: PIN and password checks consulted before any money moves.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use chrono::{DateTime, Utc};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use rand::rngs::OsRng;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::model::{Credential, UserId, UserStatus};
use crate::store::{LockSet, Store, StoreError, UserUpdate};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid transaction PIN for user {0}")]
    InvalidPin(UserId),

    #[error("user {0} has not set a transaction PIN")]
    PinNotSet(UserId),

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("too many PIN attempts for user {0}")]
    RateLimited(UserId),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("user {0} is not active")]
    Inactive(UserId),

    #[error("credential of user {0} must be migrated before use")]
    CredentialNeedsMigration(UserId),

    #[error("credential hashing failed: {0}")]
    Hash(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Opaque yes/no oracle for secrets. Called before a unit of work opens,
/// never inside one.
pub trait AuthorizationGate: Send + Sync {
    /// Check a transaction PIN.
    fn verify(&self, user: UserId, pin: &str) -> Result<(), AuthError>;

    /// Check a login; returns the user it belongs to.
    fn authenticate(&self, email: &str, password: &str) -> Result<UserId, AuthError>;
}

/// Argon2id hashing with a configurable cost.
#[derive(Clone)]
pub struct CredentialHasher {
    argon: Argon2<'static>,
}

impl CredentialHasher {
    pub fn new(config: &AuthConfig) -> Result<Self, AuthError> {
        let params = Params::new(config.hash_memory_kib, config.hash_iterations, 1, None)
            .map_err(|e| AuthError::Hash(e.to_string()))?;
        Ok(Self {
            argon: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    pub fn hash(&self, secret: &str) -> Result<Credential, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        let phc = self
            .argon
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| AuthError::Hash(e.to_string()))?;
        Ok(Credential::Hashed(phc.to_string()))
    }

    /// Cost parameters are read from the stored hash, so older hashes keep verifying.
    pub fn verify(&self, phc: &str, input: &str) -> Result<bool, AuthError> {
        let parsed = PasswordHash::new(phc).map_err(|e| AuthError::Hash(e.to_string()))?;
        Ok(self
            .argon
            .verify_password(input.as_bytes(), &parsed)
            .is_ok())
    }
}

/// Per-user throttle on PIN verification.
///
/// Constructed once at startup and injected; idle keys are evicted by
/// [`PinAttemptLimiter::spawn_sweeper`].
pub struct PinAttemptLimiter {
    limiter: DefaultKeyedRateLimiter<UserId>,
}

impl PinAttemptLimiter {
    pub fn new(config: &AuthConfig) -> Self {
        let per_minute = NonZeroU32::new(config.pin_attempts_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(per_minute)),
        }
    }

    /// Consume one attempt; false once the user is over quota.
    pub fn allow(&self, user: UserId) -> bool {
        self.limiter.check_key(&user).is_ok()
    }

    /// Forget users whose quota has fully replenished.
    pub fn sweep(&self) -> usize {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        self.limiter.len()
    }

    pub fn tracked(&self) -> usize {
        self.limiter.len()
    }

    /// Periodic eviction on the current tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let remaining = limiter.sweep();
                debug!(remaining, "pin limiter swept");
            }
        })
    }
}

/// Gate backed by the credentials held in the [`Store`].
pub struct CredentialGate {
    store: Arc<Store>,
    hasher: CredentialHasher,
    limiter: Arc<PinAttemptLimiter>,
}

impl CredentialGate {
    pub fn new(store: Arc<Store>, hasher: CredentialHasher, limiter: Arc<PinAttemptLimiter>) -> Self {
        Self {
            store,
            hasher,
            limiter,
        }
    }

    /// See [`migrate_legacy_credentials`].
    pub fn migrate_legacy_credentials(&self, now: DateTime<Utc>) -> Result<usize, AuthError> {
        migrate_legacy_credentials(&self.store, &self.hasher, now)
    }
}

/// One-time rehash of plain-text credentials imported from the old system.
///
/// Until this runs, such users cannot log in or pay. Returns how many users
/// were rewritten.
pub fn migrate_legacy_credentials(
    store: &Store,
    hasher: &CredentialHasher,
    now: DateTime<Utc>,
) -> Result<usize, AuthError> {
    let mut migrated = 0;
    for user in store.users() {
        let mut update = UserUpdate::new(user.id);
        let mut changed = false;
        if let Some(Credential::LegacyPlain(plain)) = &user.password {
            update = update.password(user.password.clone(), hasher.hash(plain)?);
            changed = true;
        }
        if let Some(Credential::LegacyPlain(plain)) = &user.pin {
            update = update.pin(user.pin.clone(), hasher.hash(plain)?);
            changed = true;
        }
        if !changed {
            continue;
        }
        let mut uow = store.begin(LockSet::new(), now);
        uow.update_user(update);
        match uow.commit() {
            Ok(()) => {
                warn!(user = user.id, "rehashed legacy plain-text credential");
                migrated += 1;
            }
            Err(StoreError::StaleUser(id)) => {
                warn!(user = id, "credential changed during migration, left as is");
            }
            Err(e) => return Err(e.into()),
        }
    }
    info!(migrated, "legacy credential migration finished");
    Ok(migrated)
}

impl AuthorizationGate for CredentialGate {
    fn verify(&self, user_id: UserId, pin: &str) -> Result<(), AuthError> {
        if !self.limiter.allow(user_id) {
            warn!(user = user_id, "pin attempt throttled");
            return Err(AuthError::RateLimited(user_id));
        }
        let user = self
            .store
            .user(user_id)
            .ok_or(AuthError::UserNotFound(user_id))?;
        if user.status != UserStatus::Active {
            return Err(AuthError::Inactive(user_id));
        }
        match &user.pin {
            None => Err(AuthError::PinNotSet(user_id)),
            Some(Credential::LegacyPlain(_)) => {
                warn!(user = user_id, "legacy plain-text pin refused");
                Err(AuthError::CredentialNeedsMigration(user_id))
            }
            Some(Credential::Hashed(phc)) => {
                if self.hasher.verify(phc, pin)? {
                    Ok(())
                } else {
                    Err(AuthError::InvalidPin(user_id))
                }
            }
        }
    }

    fn authenticate(&self, email: &str, password: &str) -> Result<UserId, AuthError> {
        let user = self
            .store
            .user_by_email(email)
            .ok_or(AuthError::InvalidCredentials)?;
        match &user.password {
            Some(Credential::Hashed(phc)) if self.hasher.verify(phc, password)? => {
                if user.status != UserStatus::Active {
                    return Err(AuthError::Inactive(user.id));
                }
                Ok(user.id)
            }
            Some(Credential::LegacyPlain(_)) => {
                warn!(user = user.id, "legacy plain-text password refused");
                Err(AuthError::CredentialNeedsMigration(user.id))
            }
            _ => Err(AuthError::InvalidCredentials),
        }
    }
}
