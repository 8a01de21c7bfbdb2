//! Shared fixtures for engine unit tests.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use super::{Engine, NewUser};
use crate::Points;
use crate::audit::{AuditEvent, ChannelAuditRecorder};
use crate::auth::{CredentialGate, CredentialHasher, PinAttemptLimiter};
use crate::clock::ManualClock;
use crate::config::{AuthConfig, Config};
use crate::ledger::{self, Posting};
use crate::model::{EntryType, ProductId, Role, UserId, WalletId};
use crate::store::{LockSet, NewProduct, Store};

pub const PIN: &str = "123456";

pub const ADMIN: UserId = 1;

pub struct TestBed {
    pub engine: Engine,
    pub clock: Arc<ManualClock>,
    pub audit: UnboundedReceiver<AuditEvent>,
}

impl TestBed {
    pub fn new() -> Self {
        let config = Config {
            auth: AuthConfig {
                pin_attempts_per_minute: 10_000,
                ..AuthConfig::fast()
            },
            ..Config::default()
        };
        let store = Arc::new(Store::in_memory());
        let hasher = CredentialHasher::new(&config.auth).unwrap();
        let limiter = Arc::new(PinAttemptLimiter::new(&config.auth));
        let gate = Arc::new(CredentialGate::new(store.clone(), hasher.clone(), limiter));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (recorder, audit) = ChannelAuditRecorder::new();
        let engine = Engine::new(store, gate, hasher, config)
            .with_clock(clock.clone())
            .with_audit(Arc::new(recorder));
        Self {
            engine,
            clock,
            audit,
        }
    }

    /// Register a user with [`PIN`] and return its wallet.
    pub fn user(&self, id: UserId, role: Role) -> WalletId {
        self.engine
            .register(NewUser {
                id,
                email: format!("u{id}@campus.test"),
                full_name: format!("User {id}"),
                role,
                password: "password".into(),
                pin: Some(PIN.into()),
            })
            .unwrap()
    }

    pub fn admin(&self) -> UserId {
        if self.engine.store().user(ADMIN).is_none() {
            self.user(ADMIN, Role::Admin);
        }
        ADMIN
    }

    pub fn student(&self, id: UserId, balance: u64) -> WalletId {
        let wallet = self.user(id, Role::Mahasiswa);
        if balance > 0 {
            self.fund(wallet, balance);
        }
        wallet
    }

    pub fn fund(&self, wallet: WalletId, amount: u64) {
        let store = self.engine.store();
        let mut uow = store.begin(LockSet::new().wallet(wallet), self.clock_now());
        ledger::credit(
            &mut uow,
            Posting::new(wallet, Points::new(amount), EntryType::Adjustment, "seed"),
        )
        .unwrap();
        uow.commit().unwrap();
    }

    pub fn product(&self, price: u64, stock: u32) -> ProductId {
        let store = self.engine.store();
        let mut uow = store.begin(LockSet::new(), self.clock_now());
        let product = uow.insert_product(NewProduct {
            name: format!("Item {price}"),
            description: String::new(),
            price: Points::new(price),
            stock,
            created_by: ADMIN,
        });
        uow.commit().unwrap();
        product.id
    }

    pub fn balance(&self, wallet: WalletId) -> u64 {
        self.engine.store().wallet(wallet).unwrap().balance.get()
    }

    pub fn stock(&self, product: ProductId) -> u32 {
        self.engine.store().product(product).unwrap().stock
    }

    pub fn entries(&self, wallet: WalletId) -> usize {
        self.engine.store().entries_for(wallet).len()
    }

    fn clock_now(&self) -> chrono::DateTime<Utc> {
        use crate::clock::Clock;
        self.clock.now()
    }
}
