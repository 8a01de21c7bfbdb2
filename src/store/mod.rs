//! In-process relational store with row-level locking.
//!
//! Every wallet, product, token and cart row sits behind its own mutex.
//! Writers go through a [`UnitOfWork`]; plain reads lock one row briefly
//! and hand back a copy.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::info;

use crate::Points;
use crate::model::{
    Cart, LedgerEntry, PaymentToken, Product, ProductId, Role, SaleRecord, User, UserId, Wallet,
    WalletId,
};

mod journal;
mod unit;

pub use journal::{CommitRecord, Journal, JournalFile};
pub use unit::{LockSet, NewProduct, RowKey, UnitOfWork, UserUpdate};

type Row<T> = Arc<Mutex<T>>;

fn row<T>(value: T) -> Row<T> {
    Arc::new(Mutex::new(value))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("journal I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal line {line} is corrupt: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("journal is unusable after a failed write")]
    JournalFailed,

    #[error("failed to encode commit record: {0}")]
    Encode(serde_json::Error),

    #[error("user {0} already exists")]
    DuplicateUser(UserId),

    #[error("email '{0}' is already registered")]
    DuplicateEmail(String),

    #[error("user {0} does not exist")]
    UnknownUser(UserId),

    #[error("user {0} already has a wallet")]
    DuplicateWallet(UserId),

    #[error("user {0} was changed by another operation")]
    StaleUser(UserId),

    #[error("payment token code collision")]
    DuplicateToken,
}

impl StoreError {
    /// Storage faults, as opposed to uniqueness violations.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_)
                | StoreError::Corrupt { .. }
                | StoreError::JournalFailed
                | StoreError::Encode(_)
        )
    }
}

/// Balance of a wallet compared against its ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub wallet_id: WalletId,
    pub balance: Points,
    pub ledger_total: i128,
    pub entries: usize,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        i128::from(self.balance.get()) == self.ledger_total
    }
}

/// Store-assigned id sequences.
#[derive(Debug, Default)]
struct Ids {
    wallet: AtomicU64,
    product: AtomicU64,
    entry: AtomicU64,
    sale: AtomicU64,
}

impl Ids {
    fn next(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn next_wallet(&self) -> WalletId {
        Self::next(&self.wallet)
    }

    fn next_product(&self) -> ProductId {
        Self::next(&self.product)
    }

    fn next_entry(&self) -> u64 {
        Self::next(&self.entry)
    }

    fn next_sale(&self) -> u64 {
        Self::next(&self.sale)
    }
}

/// Append-only records plus the journal. Its mutex also serializes commits.
#[derive(Debug, Default)]
struct Log {
    seq: u64,
    entries: Vec<LedgerEntry>,
    by_wallet: HashMap<WalletId, Vec<usize>>,
    sales: Vec<SaleRecord>,
    journal: Option<Journal>,
}

impl Log {
    fn append(&mut self, entries: Vec<LedgerEntry>, sales: Vec<SaleRecord>) {
        for entry in entries {
            self.by_wallet
                .entry(entry.wallet_id)
                .or_default()
                .push(self.entries.len());
            self.entries.push(entry);
        }
        self.sales.extend(sales);
    }
}

#[derive(Default)]
pub struct Store {
    users: RwLock<BTreeMap<UserId, User>>,
    wallets: RwLock<BTreeMap<WalletId, Row<Wallet>>>,
    wallet_by_user: RwLock<HashMap<UserId, WalletId>>,
    products: RwLock<BTreeMap<ProductId, Row<Product>>>,
    tokens: RwLock<HashMap<String, Row<PaymentToken>>>,
    carts: RwLock<HashMap<UserId, Row<Cart>>>,
    log: Mutex<Log>,
    ids: Ids,
}

/// Write access to the row tables, taken only by commits that insert rows.
struct TablesMut<'a> {
    users: RwLockWriteGuard<'a, BTreeMap<UserId, User>>,
    wallets: RwLockWriteGuard<'a, BTreeMap<WalletId, Row<Wallet>>>,
    wallet_by_user: RwLockWriteGuard<'a, HashMap<UserId, WalletId>>,
    products: RwLockWriteGuard<'a, BTreeMap<ProductId, Row<Product>>>,
    tokens: RwLockWriteGuard<'a, HashMap<String, Row<PaymentToken>>>,
}

impl TablesMut<'_> {
    fn check(
        &self,
        new_users: &[User],
        new_wallets: &[Wallet],
        new_tokens: &[PaymentToken],
    ) -> Result<(), StoreError> {
        let mut emails: HashSet<String> = self
            .users
            .values()
            .map(|u| u.email.to_lowercase())
            .collect();
        let mut ids = HashSet::new();
        for user in new_users {
            if self.users.contains_key(&user.id) || !ids.insert(user.id) {
                return Err(StoreError::DuplicateUser(user.id));
            }
            if !emails.insert(user.email.to_lowercase()) {
                return Err(StoreError::DuplicateEmail(user.email.clone()));
            }
        }

        let mut owners = HashSet::new();
        for wallet in new_wallets {
            if self.wallet_by_user.contains_key(&wallet.user_id) || !owners.insert(wallet.user_id)
            {
                return Err(StoreError::DuplicateWallet(wallet.user_id));
            }
        }
        for token in new_tokens {
            if self.tokens.contains_key(&token.code) {
                return Err(StoreError::DuplicateToken);
            }
        }
        Ok(())
    }

    /// Final rows of the users a unit updates. Later updates of the same
    /// user in one unit build on earlier ones.
    fn resolve(
        &self,
        new_users: &[User],
        updates: &[UserUpdate],
    ) -> Result<Vec<User>, StoreError> {
        let mut resolved: BTreeMap<UserId, User> = BTreeMap::new();
        for update in updates {
            let current = resolved
                .remove(&update.id)
                .or_else(|| new_users.iter().find(|u| u.id == update.id).cloned())
                .or_else(|| self.users.get(&update.id).cloned())
                .ok_or(StoreError::UnknownUser(update.id))?;
            resolved.insert(update.id, update.apply_to(current)?);
        }
        Ok(resolved.into_values().collect())
    }

    fn insert(
        &mut self,
        new_users: Vec<User>,
        updated_users: Vec<User>,
        new_wallets: Vec<Wallet>,
        new_products: Vec<Product>,
        new_tokens: Vec<PaymentToken>,
    ) {
        for user in new_users.into_iter().chain(updated_users) {
            self.users.insert(user.id, user);
        }
        for wallet in new_wallets {
            self.wallet_by_user.insert(wallet.user_id, wallet.id);
            self.wallets.insert(wallet.id, row(wallet));
        }
        for product in new_products {
            self.products.insert(product.id, row(product));
        }
        for token in new_tokens {
            self.tokens.insert(token.code.clone(), row(token));
        }
    }
}

/// Public API
impl Store {
    /// Store without a journal; state lives as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a journal-backed store, replaying every committed unit.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let (journal, records) = Journal::open(path)?;
        let store = Self::default();
        let replayed = records.len();
        for record in records {
            store.replay(record);
        }
        store.log.lock().journal = Some(journal);
        info!(
            commits = replayed,
            wallets = store.wallets.read().len(),
            "store replayed"
        );
        Ok(store)
    }

    /// Open a unit of work, locking `locks` in global order.
    ///
    /// Rows that do not exist are skipped; the unit simply won't hold them.
    pub fn begin(&self, locks: LockSet, now: DateTime<Utc>) -> UnitOfWork<'_> {
        let mut uow = UnitOfWork::new(self, now);
        for key in locks {
            match key {
                RowKey::Cart(user) => {
                    let row = self.cart_row(user);
                    uow.carts.insert(user, unit::Locked::new(row.lock_arc()));
                }
                RowKey::Token(code) => {
                    let row = self.tokens.read().get(&code).cloned();
                    if let Some(row) = row {
                        uow.tokens.insert(code, unit::Locked::new(row.lock_arc()));
                    }
                }
                RowKey::Wallet(id) => {
                    let row = self.wallets.read().get(&id).cloned();
                    if let Some(row) = row {
                        uow.wallets.insert(id, unit::Locked::new(row.lock_arc()));
                    }
                }
                RowKey::Product(id) => {
                    let row = self.products.read().get(&id).cloned();
                    if let Some(row) = row {
                        uow.products.insert(id, unit::Locked::new(row.lock_arc()));
                    }
                }
            }
        }
        uow
    }

    /// Return the user's wallet, creating an empty one if it is missing.
    pub fn ensure_wallet(&self, user_id: UserId, now: DateTime<Utc>) -> Result<WalletId, StoreError> {
        if let Some(id) = self.wallet_of(user_id) {
            return Ok(id);
        }
        let mut uow = self.begin(LockSet::new(), now);
        let id = uow.insert_wallet(user_id);
        match uow.commit() {
            Ok(()) => {
                info!(user = user_id, wallet = id, "created missing wallet");
                Ok(id)
            }
            // lost a race with another creator
            Err(StoreError::DuplicateWallet(_)) => self
                .wallet_of(user_id)
                .ok_or(StoreError::DuplicateWallet(user_id)),
            Err(e) => Err(e),
        }
    }

    pub fn user(&self, id: UserId) -> Option<User> {
        self.users.read().get(&id).cloned()
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let email = email.to_lowercase();
        self.users
            .read()
            .values()
            .find(|u| u.email.to_lowercase() == email)
            .cloned()
    }

    pub fn users(&self) -> Vec<User> {
        self.users.read().values().cloned().collect()
    }

    /// Lowest-id administrator, the default recipient of unaddressed tokens.
    pub fn first_admin(&self) -> Option<UserId> {
        self.users
            .read()
            .values()
            .find(|u| u.role == Role::Admin)
            .map(|u| u.id)
    }

    pub fn wallet_of(&self, user_id: UserId) -> Option<WalletId> {
        self.wallet_by_user.read().get(&user_id).copied()
    }

    pub fn wallet(&self, id: WalletId) -> Option<Wallet> {
        let row = self.wallets.read().get(&id).cloned()?;
        let wallet = row.lock().clone();
        Some(wallet)
    }

    pub fn wallets(&self) -> Vec<Wallet> {
        let rows: Vec<_> = self.wallets.read().values().cloned().collect();
        rows.iter().map(|row| row.lock().clone()).collect()
    }

    pub fn product(&self, id: ProductId) -> Option<Product> {
        let row = self.products.read().get(&id).cloned()?;
        let product = row.lock().clone();
        Some(product)
    }

    pub fn products(&self) -> Vec<Product> {
        let rows: Vec<_> = self.products.read().values().cloned().collect();
        rows.iter().map(|row| row.lock().clone()).collect()
    }

    pub fn token(&self, code: &str) -> Option<PaymentToken> {
        let row = self.tokens.read().get(code).cloned()?;
        let token = row.lock().clone();
        Some(token)
    }

    pub fn cart(&self, user: UserId) -> Cart {
        let row = self.carts.read().get(&user).cloned();
        match row {
            Some(row) => row.lock().clone(),
            None => Cart::new(user),
        }
    }

    /// Entries of one wallet in commit order.
    pub fn entries_for(&self, wallet: WalletId) -> Vec<LedgerEntry> {
        let log = self.log.lock();
        log.by_wallet
            .get(&wallet)
            .map(|idx| idx.iter().map(|&i| log.entries[i].clone()).collect())
            .unwrap_or_default()
    }

    /// Run `f` over the whole ledger without copying it.
    pub fn with_entries<R>(&self, f: impl FnOnce(&[LedgerEntry]) -> R) -> R {
        f(&self.log.lock().entries)
    }

    pub fn sales(&self) -> Vec<SaleRecord> {
        self.log.lock().sales.clone()
    }

    /// Last committed sequence number.
    pub fn seq(&self) -> u64 {
        self.log.lock().seq
    }

    /// Compare a wallet's balance with the sum of its successful entries.
    pub fn reconcile(&self, wallet: WalletId) -> Option<Reconciliation> {
        let row = self.wallets.read().get(&wallet).cloned()?;
        // row before log, same order as commit
        let guard = row.lock();
        let log = self.log.lock();
        let indices = log.by_wallet.get(&wallet);
        let ledger_total = indices
            .into_iter()
            .flatten()
            .map(|&i| log.entries[i].signed_amount())
            .sum();
        Some(Reconciliation {
            wallet_id: wallet,
            balance: guard.balance,
            ledger_total,
            entries: indices.map_or(0, Vec::len),
        })
    }
}

/// Private API
impl Store {
    fn cart_row(&self, user: UserId) -> Row<Cart> {
        let existing = self.carts.read().get(&user).cloned();
        if let Some(row) = existing {
            return row;
        }
        self.carts
            .write()
            .entry(user)
            .or_insert_with(|| row(Cart::new(user)))
            .clone()
    }

    fn tables_mut(&self) -> TablesMut<'_> {
        TablesMut {
            users: self.users.write(),
            wallets: self.wallets.write(),
            wallet_by_user: self.wallet_by_user.write(),
            products: self.products.write(),
            tokens: self.tokens.write(),
        }
    }

    /// Apply a journaled commit during startup. Rows are upserted by id.
    fn replay(&self, record: CommitRecord) {
        {
            let mut users = self.users.write();
            for user in record.users {
                users.insert(user.id, user);
            }
        }
        {
            let mut wallets = self.wallets.write();
            let mut by_user = self.wallet_by_user.write();
            for wallet in record.wallets {
                self.ids.wallet.fetch_max(wallet.id, Ordering::SeqCst);
                by_user.insert(wallet.user_id, wallet.id);
                upsert(&mut wallets, wallet.id, wallet);
            }
        }
        {
            let mut products = self.products.write();
            for product in record.products {
                self.ids.product.fetch_max(product.id, Ordering::SeqCst);
                upsert(&mut products, product.id, product);
            }
        }
        {
            let mut tokens = self.tokens.write();
            for token in record.tokens {
                match tokens.get(&token.code) {
                    Some(existing) => *existing.lock() = token,
                    None => {
                        tokens.insert(token.code.clone(), row(token));
                    }
                }
            }
        }
        {
            let mut carts = self.carts.write();
            for cart in record.carts {
                upsert_hashed(&mut carts, cart.user_id, cart);
            }
        }
        for entry in &record.entries {
            self.ids.entry.fetch_max(entry.id, Ordering::SeqCst);
        }
        for sale in &record.sales {
            self.ids.sale.fetch_max(sale.id, Ordering::SeqCst);
        }

        let mut log = self.log.lock();
        log.seq = log.seq.max(record.seq);
        log.append(record.entries, record.sales);
    }
}

fn upsert<T>(rows: &mut BTreeMap<u64, Row<T>>, id: u64, value: T) {
    match rows.get(&id) {
        Some(existing) => *existing.lock() = value,
        None => {
            rows.insert(id, row(value));
        }
    }
}

fn upsert_hashed<T>(rows: &mut HashMap<u64, Row<T>>, id: u64, value: T) {
    match rows.get(&id) {
        Some(existing) => *existing.lock() = value,
        None => {
            rows.insert(id, row(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, EntryType, CreatedBy, UserStatus};
    use tempfile::tempdir;

    fn user(id: UserId, email: &str, role: Role) -> User {
        User {
            id,
            email: email.to_string(),
            full_name: format!("User {id}"),
            role,
            status: UserStatus::Active,
            password: None,
            pin: None,
            created_at: Utc::now(),
        }
    }

    fn register(store: &Store, id: UserId, role: Role) -> WalletId {
        let mut uow = store.begin(LockSet::new(), Utc::now());
        uow.insert_user(user(id, &format!("u{id}@campus.test"), role));
        let wallet = uow.insert_wallet(id);
        uow.commit().unwrap();
        wallet
    }

    fn credit(store: &Store, wallet: WalletId, amount: u64) {
        let mut uow = store.begin(LockSet::new().wallet(wallet), Utc::now());
        let w = uow.wallet_mut(wallet).unwrap();
        w.balance = w.balance.checked_add(Points::new(amount)).unwrap();
        uow.append_entry(
            wallet,
            EntryType::Adjustment,
            Points::new(amount),
            Direction::Credit,
            "seed".into(),
            None,
            CreatedBy::Admin,
        );
        uow.commit().unwrap();
    }

    #[test]
    fn dropped_unit_leaves_no_trace() {
        let store = Store::in_memory();
        let wallet = register(&store, 1, Role::Mahasiswa);

        {
            let mut uow = store.begin(LockSet::new().wallet(wallet), Utc::now());
            uow.wallet_mut(wallet).unwrap().balance = Points::new(999);
            uow.append_entry(
                wallet,
                EntryType::Adjustment,
                Points::new(999),
                Direction::Credit,
                "never".into(),
                None,
                CreatedBy::Admin,
            );
            // dropped without commit
        }

        assert_eq!(store.wallet(wallet).unwrap().balance, Points::ZERO);
        assert!(store.entries_for(wallet).is_empty());
    }

    #[test]
    fn commit_publishes_rows_and_entries_together() {
        let store = Store::in_memory();
        let wallet = register(&store, 1, Role::Mahasiswa);
        credit(&store, wallet, 250);

        assert_eq!(store.wallet(wallet).unwrap().balance, Points::new(250));
        assert_eq!(store.entries_for(wallet).len(), 1);
        assert!(store.reconcile(wallet).unwrap().is_consistent());
    }

    #[test]
    fn user_updates_apply_only_over_the_value_they_replace() {
        use crate::model::Credential;

        let store = Store::in_memory();
        register(&store, 1, Role::Mahasiswa);
        let first = Credential::Hashed("$argon2id$first".into());
        let second = Credential::Hashed("$argon2id$second".into());

        // two writers read the same empty PIN
        let mut a = store.begin(LockSet::new(), Utc::now());
        a.update_user(UserUpdate::new(1).pin(None, first.clone()));
        let mut b = store.begin(LockSet::new(), Utc::now());
        b.update_user(UserUpdate::new(1).pin(None, second));

        a.commit().unwrap();
        assert!(matches!(b.commit(), Err(StoreError::StaleUser(1))));
        assert_eq!(store.user(1).unwrap().pin, Some(first));

        let mut uow = store.begin(LockSet::new(), Utc::now());
        uow.update_user(UserUpdate::new(1).status(UserStatus::Inactive));
        uow.commit().unwrap();
        let user = store.user(1).unwrap();
        assert_eq!(user.status, UserStatus::Inactive);
        assert!(user.pin.is_some());

        let mut ghost = store.begin(LockSet::new(), Utc::now());
        ghost.update_user(UserUpdate::new(9).status(UserStatus::Inactive));
        assert!(matches!(ghost.commit(), Err(StoreError::UnknownUser(9))));
    }

    #[test]
    fn missing_rows_are_not_held() {
        let store = Store::in_memory();
        let uow = store.begin(LockSet::new().wallet(42).product(7), Utc::now());
        assert!(uow.wallet(42).is_none());
        assert!(!uow.holds_product(7));
    }

    #[test]
    fn duplicate_user_is_rejected_at_commit() {
        let store = Store::in_memory();
        register(&store, 1, Role::Admin);

        let mut uow = store.begin(LockSet::new(), Utc::now());
        uow.insert_user(user(1, "other@campus.test", Role::Admin));
        assert!(matches!(uow.commit(), Err(StoreError::DuplicateUser(1))));
    }

    #[test]
    fn duplicate_email_is_case_insensitive() {
        let store = Store::in_memory();
        register(&store, 1, Role::Admin);

        let mut uow = store.begin(LockSet::new(), Utc::now());
        uow.insert_user(user(2, "U1@Campus.Test", Role::Dosen));
        assert!(matches!(uow.commit(), Err(StoreError::DuplicateEmail(_))));
        assert!(store.user(2).is_none());
    }

    #[test]
    fn ensure_wallet_is_idempotent() {
        let store = Store::in_memory();
        let mut uow = store.begin(LockSet::new(), Utc::now());
        uow.insert_user(user(5, "admin@campus.test", Role::Admin));
        uow.commit().unwrap();

        let first = store.ensure_wallet(5, Utc::now()).unwrap();
        let second = store.ensure_wallet(5, Utc::now()).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.wallets().len(), 1);
    }

    #[test]
    fn first_admin_is_lowest_id() {
        let store = Store::in_memory();
        register(&store, 9, Role::Admin);
        register(&store, 3, Role::Admin);
        register(&store, 1, Role::Mahasiswa);
        assert_eq!(store.first_admin(), Some(3));
    }

    #[test]
    fn journal_replay_restores_state_and_sequences() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.journal");

        let wallet = {
            let store = Store::open(&path).unwrap();
            let wallet = register(&store, 1, Role::Mahasiswa);
            credit(&store, wallet, 120);
            credit(&store, wallet, 30);
            wallet
        };

        let store = Store::open(&path).unwrap();
        assert_eq!(store.seq(), 3);
        assert_eq!(store.wallet(wallet).unwrap().balance, Points::new(150));
        assert_eq!(store.entries_for(wallet).len(), 2);
        assert!(store.reconcile(wallet).unwrap().is_consistent());

        // sequences continue after the replayed ids
        let next = register(&store, 2, Role::Mahasiswa);
        assert!(next > wallet);
    }
}
