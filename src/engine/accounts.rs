//! Accounts: registration with paired wallet, logins, credential changes
//! and deactivation.

use tracing::info;

use super::{Engine, EngineError};
use crate::auth::{self, AuthError};
use crate::model::{Credential, Role, User, UserId, UserStatus, WalletId};
use crate::store::{LockSet, UserUpdate};

/// Transaction PINs are exactly this many digits.
const PIN_DIGITS: usize = 6;

#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: UserId,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub password: String,
    pub pin: Option<String>,
}

impl Engine {
    /// Create a user and its empty wallet in one unit.
    pub fn register(&self, new: NewUser) -> Result<WalletId, EngineError> {
        validate_new_user(&new)?;
        let password = self.hasher.hash(&new.password)?;
        let pin = match new.pin.as_deref() {
            Some(pin) => {
                validate_pin(pin)?;
                Some(self.hasher.hash(pin)?)
            }
            None => None,
        };
        self.create_account(new, password, pin)
    }

    /// Bring over an account from the old system with its secrets as they
    /// were stored there. It can neither log in nor pay until
    /// [`Engine::migrate_credentials`] rehashes them.
    pub fn import_legacy_user(&self, new: NewUser) -> Result<WalletId, EngineError> {
        validate_new_user(&new)?;
        let password = Credential::LegacyPlain(new.password.clone());
        let pin = new.pin.clone().map(Credential::LegacyPlain);
        self.create_account(new, password, pin)
    }

    /// Rehash every plain-text credential. Admin only.
    pub fn migrate_credentials(&self, admin: UserId) -> Result<usize, EngineError> {
        self.require_role(admin, &[Role::Admin], "migrate credentials")?;
        Ok(auth::migrate_legacy_credentials(
            &self.store,
            &self.hasher,
            self.now(),
        )?)
    }

    pub fn login(&self, email: &str, password: &str) -> Result<UserId, EngineError> {
        Ok(self.gate.authenticate(email, password)?)
    }

    /// Set or change the transaction PIN. Changing an existing PIN requires the current one.
    pub fn set_pin(
        &self,
        user_id: UserId,
        old_pin: Option<&str>,
        new_pin: &str,
    ) -> Result<(), EngineError> {
        validate_pin(new_pin)?;
        let user = self.require_user(user_id)?;
        if user.pin.is_some() {
            let old_pin =
                old_pin.ok_or(EngineError::Validation("current PIN is required to change it"))?;
            self.verify_pin(user_id, old_pin)?;
        }

        let pin = self.hasher.hash(new_pin)?;
        self.update_user(UserUpdate::new(user_id).pin(user.pin, pin))
    }

    /// Change one's own password after proving the current one.
    pub fn change_password(
        &self,
        user_id: UserId,
        old_password: &str,
        new_password: &str,
    ) -> Result<(), EngineError> {
        validate_password(new_password)?;
        let user = self.require_user(user_id)?;
        if user.status != UserStatus::Active {
            return Err(AuthError::Inactive(user_id).into());
        }
        match &user.password {
            Some(Credential::Hashed(phc)) if self.hasher.verify(phc, old_password)? => {}
            Some(Credential::LegacyPlain(_)) => {
                return Err(AuthError::CredentialNeedsMigration(user_id).into());
            }
            _ => return Err(AuthError::InvalidCredentials.into()),
        }

        let password = self.hasher.hash(new_password)?;
        self.update_user(UserUpdate::new(user_id).password(user.password, password))?;
        info!(user = user_id, "password changed");
        Ok(())
    }

    /// Replace a user's password without the current one. Admin only.
    pub fn reset_password(
        &self,
        admin: UserId,
        user_id: UserId,
        new_password: &str,
    ) -> Result<(), EngineError> {
        self.require_role(admin, &[Role::Admin], "reset passwords")?;
        validate_password(new_password)?;
        let user = self.require_user(user_id)?;

        let password = self.hasher.hash(new_password)?;
        self.update_user(UserUpdate::new(user_id).password(user.password, password))?;
        info!(admin, user = user_id, "password reset by admin");
        Ok(())
    }

    /// Soft-delete an account. The user can no longer log in or pay; the
    /// wallet and its history stay. Admin only.
    pub fn deactivate_user(&self, admin: UserId, user_id: UserId) -> Result<(), EngineError> {
        self.require_role(admin, &[Role::Admin], "deactivate users")?;
        if admin == user_id {
            return Err(EngineError::Validation("admins cannot deactivate themselves"));
        }
        self.require_user(user_id)?;

        self.update_user(UserUpdate::new(user_id).status(UserStatus::Inactive))?;
        info!(admin, user = user_id, "user deactivated");
        Ok(())
    }

    fn update_user(&self, update: UserUpdate) -> Result<(), EngineError> {
        let mut uow = self.store.begin(LockSet::new(), self.now());
        uow.update_user(update);
        uow.commit()?;
        Ok(())
    }

    fn create_account(
        &self,
        new: NewUser,
        password: Credential,
        pin: Option<Credential>,
    ) -> Result<WalletId, EngineError> {
        let now = self.now();
        let mut uow = self.store.begin(LockSet::new(), now);
        uow.insert_user(User {
            id: new.id,
            email: new.email.trim().to_string(),
            full_name: new.full_name.trim().to_string(),
            role: new.role,
            status: UserStatus::Active,
            password: Some(password),
            pin,
            created_at: now,
        });
        let wallet = uow.insert_wallet(new.id);
        uow.commit()?;
        info!(user = new.id, wallet, role = ?new.role, "account created");
        Ok(wallet)
    }
}

fn validate_new_user(new: &NewUser) -> Result<(), EngineError> {
    if new.id == 0 {
        return Err(EngineError::Validation("user id must be positive"));
    }
    let email = new.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(EngineError::Validation("email is malformed"));
    }
    if new.full_name.trim().is_empty() {
        return Err(EngineError::Validation("full name is required"));
    }
    validate_password(&new.password)
}

fn validate_password(password: &str) -> Result<(), EngineError> {
    if password.is_empty() {
        return Err(EngineError::Validation("password is required"));
    }
    Ok(())
}

fn validate_pin(pin: &str) -> Result<(), EngineError> {
    if pin.len() != PIN_DIGITS || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EngineError::Validation("PIN must be exactly 6 digits"));
    }
    Ok(())
}
