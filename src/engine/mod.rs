//! Points engine.
//!
//! The engine owns the collaborators every operation needs (store, gate,
//! audit, clock) and exposes one method per business operation. [`Engine::apply`]
//! is the single dispatcher: it logs every command and audits every success.
//! Also supports an async stream of commands.
//!
//! All methods take `&self`; the store does its own row locking, so one engine
//! can be shared across threads.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditRecorder, Origin, TracingAuditRecorder};
use crate::auth::{AuthorizationGate, CredentialHasher};
use crate::clock::{Clock, SystemClock};
use crate::command::{Command, Outcome};
use crate::config::Config;
use crate::model::{Role, User, UserId, WalletId};
use crate::store::Store;
use crate::token;

mod accounts;
mod admin;
mod marketplace;
mod redeem;
mod transfer;

#[cfg(test)]
mod testkit;

mod error;
pub use error::{EngineError, ErrorKind, MarketplaceError};

pub use accounts::NewUser;
pub use admin::{Standing, Stats};
pub use marketplace::{CartLine, CartView, ProductPatch};
pub use redeem::TokenRequest;

/// The points engine.
pub struct Engine {
    store: Arc<Store>,
    gate: Arc<dyn AuthorizationGate>,
    hasher: CredentialHasher,
    audit: Arc<dyn AuditRecorder>,
    clock: Arc<dyn Clock>,
    config: Config,
}

/// Public API
impl Engine {
    pub fn new(
        store: Arc<Store>,
        gate: Arc<dyn AuthorizationGate>,
        hasher: CredentialHasher,
        config: Config,
    ) -> Self {
        Self {
            store,
            gate,
            hasher,
            audit: Arc::new(TracingAuditRecorder),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditRecorder>) -> Self {
        self.audit = audit;
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the engine with the given command stream.
    ///
    /// Tokens issued with a `label` can be referred to by that label in later
    /// commands of the same stream.
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) {
        let mut labels: HashMap<String, String> = HashMap::new();
        let origin = Origin::default();
        while let Some(mut command) = stream.next().await {
            if let Some(reference) = command.token_mut()
                && let Some(code) = labels.get(reference.as_str())
            {
                *reference = code.clone();
            }
            let label = match &command {
                Command::IssueToken { label, .. } => label.clone(),
                _ => None,
            };
            // any error should not stop the engine, apply already logged it
            if let Ok(Outcome::TokenIssued { token }) = self.apply(command, &origin)
                && let Some(label) = label
            {
                labels.insert(label, token.code);
            }
        }
    }

    /// Apply a single command. Successes are audited after commit; a failing
    /// recorder is logged and otherwise ignored.
    pub fn apply(&self, command: Command, origin: &Origin) -> Result<Outcome, EngineError> {
        let op = command.name();
        let actor = command.actor();
        let result = self.dispatch(command);
        Self::log_result(op, actor, &result);

        if let Ok(outcome) = &result
            && let Some(event) = self.audit_event(op, actor, outcome)
            && let Err(e) = self.audit.record(event.origin(origin))
        {
            warn!(op, reason = %e, "audit record dropped");
        }
        result
    }
}

/// Private API
impl Engine {
    fn dispatch(&self, command: Command) -> Result<Outcome, EngineError> {
        match command {
            Command::Register {
                id,
                email,
                full_name,
                role,
                password,
                pin,
            } => {
                let wallet = self.register(NewUser {
                    id,
                    email,
                    full_name,
                    role,
                    password,
                    pin,
                })?;
                Ok(Outcome::Registered { user: id, wallet })
            }
            Command::ImportUser {
                id,
                email,
                full_name,
                role,
                password,
                pin,
            } => {
                let wallet = self.import_legacy_user(NewUser {
                    id,
                    email,
                    full_name,
                    role,
                    password,
                    pin,
                })?;
                Ok(Outcome::Registered { user: id, wallet })
            }
            Command::MigrateCredentials { admin } => {
                let users = self.migrate_credentials(admin)?;
                Ok(Outcome::CredentialsMigrated { users })
            }
            Command::Login { email, password } => {
                let user = self.login(&email, &password)?;
                Ok(Outcome::Authenticated { user })
            }
            Command::SetPin {
                user,
                old_pin,
                new_pin,
            } => {
                self.set_pin(user, old_pin.as_deref(), &new_pin)?;
                Ok(Outcome::PinSet { user })
            }
            Command::ChangePassword {
                user,
                old_password,
                new_password,
            } => {
                self.change_password(user, &old_password, &new_password)?;
                Ok(Outcome::UserUpdated { user })
            }
            Command::ResetPassword {
                admin,
                user,
                password,
            } => {
                self.reset_password(admin, user, &password)?;
                Ok(Outcome::UserUpdated { user })
            }
            Command::DeactivateUser { admin, user } => {
                self.deactivate_user(admin, user)?;
                Ok(Outcome::UserUpdated { user })
            }
            Command::Adjust {
                admin,
                user,
                amount,
                direction,
                description,
            } => {
                let entry = self.adjust(admin, user, amount, direction, &description)?;
                Ok(Outcome::Posted { entry })
            }
            Command::ResetBalance {
                admin,
                user,
                balance,
                reason,
            } => {
                let (wallet, entry) = self.reset_balance(admin, user, balance, &reason)?;
                Ok(Outcome::BalanceReset { wallet, entry })
            }
            Command::RewardMission {
                reviewer,
                user,
                mission,
                title,
                amount,
            } => {
                let entry = self.reward_mission(reviewer, user, mission, &title, amount)?;
                Ok(Outcome::Posted { entry })
            }
            Command::Transfer {
                from,
                to,
                amount,
                description,
                pin,
            } => Ok(Outcome::Transferred(self.transfer(
                from,
                to,
                amount,
                &description,
                &pin,
            )?)),
            Command::CreateProduct {
                admin,
                name,
                description,
                price,
                stock,
            } => {
                let product = self.create_product(admin, &name, &description, price, stock)?;
                Ok(Outcome::ProductSaved { product })
            }
            Command::UpdateProduct {
                admin,
                product,
                name,
                description,
                price,
                stock,
            } => {
                let patch = ProductPatch {
                    name,
                    description,
                    price,
                    stock,
                };
                let product = self.update_product(admin, product, patch)?;
                Ok(Outcome::ProductSaved { product })
            }
            Command::DeactivateProduct { admin, product } => {
                let product = self.deactivate_product(admin, product)?;
                Ok(Outcome::ProductSaved { product })
            }
            Command::Purchase {
                user,
                product,
                quantity,
                pin,
            } => Ok(Outcome::Purchased(
                self.purchase(user, product, quantity, &pin)?,
            )),
            Command::AddToCart {
                user,
                product,
                quantity,
            } => {
                let cart = self.add_to_cart(user, product, quantity)?;
                Ok(Outcome::CartUpdated { cart })
            }
            Command::UpdateCart {
                user,
                product,
                quantity,
            } => {
                let cart = self.update_cart_item(user, product, quantity)?;
                Ok(Outcome::CartUpdated { cart })
            }
            Command::RemoveFromCart { user, product } => {
                let cart = self.remove_from_cart(user, product)?;
                Ok(Outcome::CartUpdated { cart })
            }
            Command::Checkout { user, pin } => Ok(Outcome::Purchased(self.checkout(user, &pin)?)),
            Command::IssueToken {
                user,
                amount,
                merchant,
                kind,
                recipient,
                product,
                ttl_secs,
                label: _,
            } => {
                let token = self.issue_token(
                    user,
                    TokenRequest {
                        amount,
                        merchant,
                        kind,
                        recipient,
                        product,
                        ttl: ttl_secs.map(token::ttl_from_secs).transpose()?,
                    },
                )?;
                Ok(Outcome::TokenIssued { token })
            }
            Command::LookupToken { token } => Ok(Outcome::Token {
                token: self.lookup_token(&token)?,
            }),
            Command::RedeemToken { token, user, pin } => {
                Ok(Outcome::Redeemed(self.redeem(&token, user, &pin)?))
            }
            Command::ConsumeToken {
                token,
                user,
                amount,
            } => Ok(Outcome::Token {
                token: self.consume_token(&token, user, amount)?,
            }),
        }
    }

    /// Small helper to log `apply` results
    fn log_result(op: &str, actor: Option<UserId>, result: &Result<Outcome, EngineError>) {
        match (result, actor) {
            (Ok(_), Some(user)) => {
                info!(user = %user, "{op} applied");
            }
            (Ok(_), None) => {
                info!("{op} applied");
            }
            (Err(e), Some(user)) => {
                warn!(
                    user = %user,
                    kind = ?e.kind(),
                    reason = %e,
                    "{op} skipped"
                );
            }
            (Err(e), None) => {
                warn!(kind = ?e.kind(), reason = %e, "{op} skipped");
            }
        }
    }

    /// Audit entry for a successful command; reads are not audited.
    fn audit_event(
        &self,
        op: &'static str,
        actor: Option<UserId>,
        outcome: &Outcome,
    ) -> Option<AuditEvent> {
        let user = actor.unwrap_or_default();
        let event = match outcome {
            Outcome::Registered { user, wallet } => {
                AuditEvent::new(*user, op, "user", user).details(json!({ "wallet": wallet }))
            }
            Outcome::Authenticated { user } => AuditEvent::new(*user, op, "user", user),
            Outcome::CredentialsMigrated { users } => {
                AuditEvent::new(user, op, "user", "*").details(json!({ "users": users }))
            }
            Outcome::PinSet { user } => AuditEvent::new(*user, op, "user", user),
            Outcome::UserUpdated { user: target } => AuditEvent::new(user, op, "user", target),
            Outcome::Posted { entry } => AuditEvent::new(user, op, "wallet", entry.wallet_id)
                .details(json!({
                    "type": entry.kind,
                    "direction": entry.direction,
                    "amount": entry.amount,
                    "reference": entry.reference_id,
                })),
            Outcome::BalanceReset { wallet, entry } => AuditEvent::new(user, op, "wallet", wallet)
                .details(json!({
                    "direction": entry.as_ref().map(|e| e.direction),
                    "amount": entry.as_ref().map(|e| e.amount),
                })),
            Outcome::Transferred(info) => AuditEvent::new(user, op, "wallet", info.from_wallet)
                .details(json!({ "to_wallet": info.to_wallet, "amount": info.amount })),
            Outcome::ProductSaved { product } => AuditEvent::new(user, op, "product", product.id)
                .details(json!({
                    "price": product.price,
                    "stock": product.stock,
                    "status": product.status,
                })),
            Outcome::CartUpdated { .. } => return None,
            Outcome::Purchased(receipt) => AuditEvent::new(user, op, "wallet", receipt.wallet)
                .details(json!({
                    "total": receipt.total,
                    "items": receipt.sales.len(),
                })),
            Outcome::TokenIssued { token } => {
                AuditEvent::new(user, op, "payment_token", token::fingerprint(&token.code))
                    .details(json!({ "amount": token.amount, "type": token.kind }))
            }
            Outcome::Token { token } => {
                if op == "lookup_token" {
                    return None;
                }
                AuditEvent::new(user, op, "payment_token", token::fingerprint(&token.code))
                    .details(json!({ "amount": token.amount }))
            }
            Outcome::Redeemed(redemption) => AuditEvent::new(
                user,
                op,
                "payment_token",
                token::fingerprint(&redemption.token.code),
            )
            .details(json!({
                "amount": redemption.token.amount,
                "payer_wallet": redemption.payer.wallet_id,
                "recipient_wallet": redemption.recipient.wallet_id,
            })),
        };
        Some(event.at(self.now()))
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn require_user(&self, id: UserId) -> Result<User, EngineError> {
        self.store.user(id).ok_or(EngineError::UserNotFound(id))
    }

    /// Load `id` and check it holds one of `roles`.
    fn require_role(
        &self,
        id: UserId,
        roles: &[Role],
        action: &'static str,
    ) -> Result<User, EngineError> {
        let user = self.require_user(id)?;
        if !roles.contains(&user.role) {
            return Err(EngineError::Forbidden {
                user: id,
                role: user.role,
                action,
            });
        }
        Ok(user)
    }

    fn wallet_of(&self, user: UserId) -> Result<WalletId, EngineError> {
        self.store.wallet_of(user).ok_or(EngineError::NoWallet(user))
    }

    /// Consult the gate. Always called before a unit of work opens.
    fn verify_pin(&self, user: UserId, pin: &str) -> Result<(), EngineError> {
        self.gate.verify(user, pin)?;
        Ok(())
    }
}
