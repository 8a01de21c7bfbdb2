//! Unit of work: the atomic scope of one business operation.
//!
//! Rows are locked up front in a single global order (see [`RowKey`]) and
//! stay locked until the unit is committed or dropped. Mutations are made to
//! private copies; nothing is visible to other threads until `commit`.
//! Dropping an uncommitted unit discards everything.

use chrono::{DateTime, Utc};
use parking_lot::{ArcMutexGuard, RawMutex};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::journal::CommitRecord;
use super::{Store, StoreError};
use crate::Points;
use crate::model::{
    Cart, CreatedBy, Credential, Direction, EntryStatus, EntryType, LedgerEntry, PaymentToken,
    Product, ProductId, SaleRecord, User, UserId, UserStatus, Wallet, WalletId,
};

/// A lockable row. The derived order is the global lock order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowKey {
    Cart(UserId),
    Token(String),
    Wallet(WalletId),
    Product(ProductId),
}

/// Rows a unit of work will lock, kept sorted.
#[derive(Debug, Clone, Default)]
pub struct LockSet(BTreeSet<RowKey>);

impl LockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wallet(mut self, id: WalletId) -> Self {
        self.0.insert(RowKey::Wallet(id));
        self
    }

    pub fn product(mut self, id: ProductId) -> Self {
        self.0.insert(RowKey::Product(id));
        self
    }

    pub fn products(mut self, ids: impl IntoIterator<Item = ProductId>) -> Self {
        self.0.extend(ids.into_iter().map(RowKey::Product));
        self
    }

    pub fn token(mut self, code: impl Into<String>) -> Self {
        self.0.insert(RowKey::Token(code.into()));
        self
    }

    pub fn cart(mut self, user: UserId) -> Self {
        self.0.insert(RowKey::Cart(user));
        self
    }

}

impl IntoIterator for LockSet {
    type Item = RowKey;
    type IntoIter = std::collections::btree_set::IntoIter<RowKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A locked row and the unit's private copy of it.
pub(super) struct Locked<T> {
    guard: ArcMutexGuard<RawMutex, T>,
    working: T,
    dirty: bool,
}

impl<T: Clone> Locked<T> {
    pub(super) fn new(guard: ArcMutexGuard<RawMutex, T>) -> Self {
        let working = (*guard).clone();
        Self {
            guard,
            working,
            dirty: false,
        }
    }

    fn get(&self) -> &T {
        &self.working
    }

    fn get_mut(&mut self) -> &mut T {
        self.dirty = true;
        &mut self.working
    }

    fn publish(&mut self) {
        if self.dirty {
            *self.guard = self.working.clone();
        }
    }
}

/// Changes to an existing user, applied to the row as it is at commit.
///
/// Each credential change names the value it replaces. If another unit
/// changed that credential first, the commit fails with
/// [`StoreError::StaleUser`] instead of overwriting it.
#[derive(Debug, Clone)]
pub struct UserUpdate {
    pub id: UserId,
    password: Option<(Option<Credential>, Credential)>,
    pin: Option<(Option<Credential>, Credential)>,
    status: Option<UserStatus>,
}

impl UserUpdate {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            password: None,
            pin: None,
            status: None,
        }
    }

    pub fn password(mut self, replaces: Option<Credential>, new: Credential) -> Self {
        self.password = Some((replaces, new));
        self
    }

    pub fn pin(mut self, replaces: Option<Credential>, new: Credential) -> Self {
        self.pin = Some((replaces, new));
        self
    }

    pub fn status(mut self, status: UserStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub(super) fn apply_to(&self, mut user: User) -> Result<User, StoreError> {
        for (slot, change) in [(&mut user.password, &self.password), (&mut user.pin, &self.pin)] {
            if let Some((replaces, new)) = change {
                if slot != replaces {
                    return Err(StoreError::StaleUser(self.id));
                }
                *slot = Some(new.clone());
            }
        }
        if let Some(status) = self.status {
            user.status = status;
        }
        Ok(user)
    }
}

/// Fields of a product that does not exist yet.
#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub description: String,
    pub price: Points,
    pub stock: u32,
    pub created_by: UserId,
}

/// The atomic scope of one business operation.
pub struct UnitOfWork<'s> {
    store: &'s Store,
    now: DateTime<Utc>,
    pub(super) wallets: BTreeMap<WalletId, Locked<Wallet>>,
    pub(super) products: BTreeMap<ProductId, Locked<Product>>,
    pub(super) tokens: BTreeMap<String, Locked<PaymentToken>>,
    pub(super) carts: BTreeMap<UserId, Locked<Cart>>,
    pub(super) new_users: Vec<User>,
    pub(super) user_updates: Vec<UserUpdate>,
    pub(super) new_wallets: Vec<Wallet>,
    pub(super) new_products: Vec<Product>,
    pub(super) new_tokens: Vec<PaymentToken>,
    pub(super) entries: Vec<LedgerEntry>,
    pub(super) sales: Vec<SaleRecord>,
}

impl<'s> UnitOfWork<'s> {
    pub(super) fn new(store: &'s Store, now: DateTime<Utc>) -> Self {
        Self {
            store,
            now,
            wallets: BTreeMap::new(),
            products: BTreeMap::new(),
            tokens: BTreeMap::new(),
            carts: BTreeMap::new(),
            new_users: Vec::new(),
            user_updates: Vec::new(),
            new_wallets: Vec::new(),
            new_products: Vec::new(),
            new_tokens: Vec::new(),
            entries: Vec::new(),
            sales: Vec::new(),
        }
    }

    /// Time the unit was opened; stamped on everything it creates.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn store(&self) -> &'s Store {
        self.store
    }

    // Locked rows

    pub fn wallet(&self, id: WalletId) -> Option<&Wallet> {
        self.wallets.get(&id).map(Locked::get)
    }

    /// Balance mutation is reserved to the ledger core.
    pub(crate) fn wallet_mut(&mut self, id: WalletId) -> Option<&mut Wallet> {
        self.wallets.get_mut(&id).map(Locked::get_mut)
    }

    pub fn product(&self, id: ProductId) -> Option<&Product> {
        self.products.get(&id).map(Locked::get)
    }

    pub fn product_mut(&mut self, id: ProductId) -> Option<&mut Product> {
        self.products.get_mut(&id).map(Locked::get_mut)
    }

    pub fn holds_product(&self, id: ProductId) -> bool {
        self.products.contains_key(&id)
    }

    pub fn token(&self, code: &str) -> Option<&PaymentToken> {
        self.tokens.get(code).map(Locked::get)
    }

    pub fn token_mut(&mut self, code: &str) -> Option<&mut PaymentToken> {
        self.tokens.get_mut(code).map(Locked::get_mut)
    }

    pub fn cart(&self, user: UserId) -> Option<&Cart> {
        self.carts.get(&user).map(Locked::get)
    }

    pub fn cart_mut(&mut self, user: UserId) -> Option<&mut Cart> {
        self.carts.get_mut(&user).map(Locked::get_mut)
    }

    // Inserts and appends

    /// Stage a new user; rejected at commit if the id or email is taken.
    pub fn insert_user(&mut self, user: User) {
        self.new_users.push(user);
    }

    /// Stage changes to an existing user; see [`UserUpdate`].
    pub fn update_user(&mut self, update: UserUpdate) {
        self.user_updates.push(update);
    }

    /// Stage an empty wallet; rejected at commit if the user already has one.
    pub fn insert_wallet(&mut self, user_id: UserId) -> WalletId {
        let id = self.store.ids.next_wallet();
        self.new_wallets.push(Wallet {
            id,
            user_id,
            balance: Points::ZERO,
            last_sync_at: None,
            created_at: self.now,
        });
        id
    }

    pub fn insert_product(&mut self, draft: NewProduct) -> Product {
        let product = Product {
            id: self.store.ids.next_product(),
            name: draft.name,
            description: draft.description,
            price: draft.price,
            stock: draft.stock,
            status: Default::default(),
            created_by: draft.created_by,
            created_at: self.now,
        };
        self.new_products.push(product.clone());
        product
    }

    pub fn insert_token(&mut self, token: PaymentToken) {
        self.new_tokens.push(token);
    }

    /// Stage a ledger entry. Only the ledger core pairs this with a balance change.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn append_entry(
        &mut self,
        wallet_id: WalletId,
        kind: EntryType,
        amount: Points,
        direction: Direction,
        description: String,
        reference_id: Option<u64>,
        created_by: CreatedBy,
    ) -> LedgerEntry {
        let entry = LedgerEntry {
            id: self.store.ids.next_entry(),
            wallet_id,
            kind,
            amount,
            direction,
            status: EntryStatus::Success,
            description,
            reference_id,
            created_by,
            created_at: self.now,
        };
        self.entries.push(entry.clone());
        entry
    }

    pub fn record_sale(
        &mut self,
        wallet_id: WalletId,
        product_id: ProductId,
        unit_price: Points,
        quantity: u32,
        total: Points,
    ) -> SaleRecord {
        let sale = SaleRecord {
            id: self.store.ids.next_sale(),
            wallet_id,
            product_id,
            unit_price,
            quantity,
            total,
            created_at: self.now,
        };
        self.sales.push(sale.clone());
        sale
    }

    fn has_inserts(&self) -> bool {
        !(self.new_users.is_empty()
            && self.user_updates.is_empty()
            && self.new_wallets.is_empty()
            && self.new_products.is_empty()
            && self.new_tokens.is_empty())
    }

    fn to_record(&self) -> CommitRecord {
        fn dirty<K, T: Clone>(rows: &BTreeMap<K, Locked<T>>) -> Vec<T> {
            rows.values()
                .filter(|row| row.dirty)
                .map(|row| row.working.clone())
                .collect()
        }

        let users = self.new_users.clone();
        let mut wallets = dirty(&self.wallets);
        wallets.extend(self.new_wallets.iter().cloned());
        let mut products = dirty(&self.products);
        products.extend(self.new_products.iter().cloned());
        let mut tokens = dirty(&self.tokens);
        tokens.extend(self.new_tokens.iter().cloned());

        CommitRecord {
            seq: 0,
            users,
            wallets,
            products,
            tokens,
            carts: dirty(&self.carts),
            entries: self.entries.clone(),
            sales: self.sales.clone(),
        }
    }

    /// Make every staged change visible at once.
    ///
    /// Constraint checks and the journal write happen before anything is
    /// published; if either fails the unit is dropped as a rollback.
    pub fn commit(mut self) -> Result<(), StoreError> {
        let store = self.store;
        let mut record = self.to_record();
        if record.is_empty() && self.user_updates.is_empty() {
            return Ok(());
        }

        let mut log = store.log.lock();

        let mut tables = if self.has_inserts() {
            let tables = store.tables_mut();
            tables.check(&self.new_users, &self.new_wallets, &self.new_tokens)?;
            // resolved against the rows as they are now, under the table lock
            let updated = tables.resolve(&self.new_users, &self.user_updates)?;
            record.users.extend(updated.iter().cloned());
            Some((tables, updated))
        } else {
            None
        };

        record.seq = log.seq + 1;
        if let Some(journal) = log.journal.as_mut() {
            journal.append(&record)?;
        }
        log.seq = record.seq;

        for row in self.wallets.values_mut() {
            row.publish();
        }
        for row in self.products.values_mut() {
            row.publish();
        }
        for row in self.tokens.values_mut() {
            row.publish();
        }
        for row in self.carts.values_mut() {
            row.publish();
        }
        if let Some((tables, updated)) = tables.as_mut() {
            tables.insert(
                std::mem::take(&mut self.new_users),
                std::mem::take(updated),
                std::mem::take(&mut self.new_wallets),
                std::mem::take(&mut self.new_products),
                std::mem::take(&mut self.new_tokens),
            );
        }
        log.append(std::mem::take(&mut self.entries), std::mem::take(&mut self.sales));

        debug!(seq = record.seq, entries = record.entries.len(), "unit committed");
        Ok(())
    }
}
