#![allow(dead_code)]

use std::sync::Arc;

use campus_points::Engine;
use campus_points::auth::{CredentialGate, CredentialHasher, PinAttemptLimiter};
use campus_points::config::{AuthConfig, Config};
use campus_points::engine::NewUser;
use campus_points::model::{Direction, Role, UserId, WalletId};
use campus_points::store::Store;

pub const PIN: &str = "123456";
pub const ADMIN: UserId = 1;

/// Engine with cheap hashing, no practical PIN throttle and an admin account.
pub fn engine() -> Engine {
    let config = Config {
        auth: AuthConfig {
            pin_attempts_per_minute: 1_000_000,
            ..AuthConfig::fast()
        },
        ..Config::default()
    };
    let store = Arc::new(Store::in_memory());
    let hasher = CredentialHasher::new(&config.auth).unwrap();
    let limiter = Arc::new(PinAttemptLimiter::new(&config.auth));
    let gate = Arc::new(CredentialGate::new(store.clone(), hasher.clone(), limiter));
    let engine = Engine::new(store, gate, hasher, config);
    register(&engine, ADMIN, Role::Admin);
    engine
}

pub fn register(engine: &Engine, id: UserId, role: Role) -> WalletId {
    engine
        .register(NewUser {
            id,
            email: format!("user{id}@campus.test"),
            full_name: format!("User {id}"),
            role,
            password: "password".into(),
            pin: Some(PIN.into()),
        })
        .unwrap()
}

/// Student with `balance` points credited by the admin.
pub fn student(engine: &Engine, id: UserId, balance: i64) -> WalletId {
    let wallet = register(engine, id, Role::Mahasiswa);
    if balance > 0 {
        engine
            .adjust(ADMIN, id, balance, Direction::Credit, "seed")
            .unwrap();
    }
    wallet
}

pub fn balance(engine: &Engine, wallet: WalletId) -> u64 {
    engine.store().wallet(wallet).unwrap().balance.get()
}
