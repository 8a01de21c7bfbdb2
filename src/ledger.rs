//! Ledger core: the only code that changes a wallet balance.
//!
//! Each primitive pairs the balance change with exactly one ledger entry
//! inside the caller's [`UnitOfWork`], so the two commit or vanish together.
//! The wallet row must be part of the unit's lock set.

use thiserror::Error;

use crate::Points;
use crate::model::{CreatedBy, Direction, EntryType, LedgerEntry, WalletId};
use crate::store::{LockSet, Store, StoreError, UnitOfWork};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("amount must be a positive integer, got {0}")]
    InvalidAmount(i64),

    #[error("insufficient balance in wallet {wallet}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        wallet: WalletId,
        balance: Points,
        requested: Points,
    },

    #[error("wallet {0} not found")]
    WalletNotFound(WalletId),

    #[error("balance of wallet {0} would overflow")]
    Overflow(WalletId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One side of a balance change.
#[derive(Debug, Clone)]
pub struct Posting {
    pub wallet: WalletId,
    pub amount: Points,
    pub kind: EntryType,
    pub description: String,
    pub reference: Option<u64>,
    pub created_by: CreatedBy,
}

impl Posting {
    pub fn new(
        wallet: WalletId,
        amount: Points,
        kind: EntryType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            wallet,
            amount,
            kind,
            description: description.into(),
            reference: None,
            created_by: CreatedBy::System,
        }
    }

    pub fn reference(mut self, reference: Option<u64>) -> Self {
        self.reference = reference;
        self
    }

    pub fn created_by(mut self, created_by: CreatedBy) -> Self {
        self.created_by = created_by;
        self
    }
}

/// Decrease a balance, refusing to go below zero.
///
/// The sufficiency check reads the locked row, so no concurrent debit can
/// slip in between the check and the write.
pub fn debit(uow: &mut UnitOfWork<'_>, posting: Posting) -> Result<LedgerEntry, LedgerError> {
    if posting.amount.is_zero() {
        return Err(LedgerError::InvalidAmount(0));
    }
    let now = uow.now();
    let wallet = uow
        .wallet_mut(posting.wallet)
        .ok_or(LedgerError::WalletNotFound(posting.wallet))?;
    let remaining =
        wallet
            .balance
            .checked_sub(posting.amount)
            .ok_or(LedgerError::InsufficientBalance {
                wallet: posting.wallet,
                balance: wallet.balance,
                requested: posting.amount,
            })?;
    wallet.balance = remaining;
    wallet.last_sync_at = Some(now);

    Ok(uow.append_entry(
        posting.wallet,
        posting.kind,
        posting.amount,
        Direction::Debit,
        posting.description,
        posting.reference,
        posting.created_by,
    ))
}

/// Increase a balance.
pub fn credit(uow: &mut UnitOfWork<'_>, posting: Posting) -> Result<LedgerEntry, LedgerError> {
    if posting.amount.is_zero() {
        return Err(LedgerError::InvalidAmount(0));
    }
    let now = uow.now();
    let wallet = uow
        .wallet_mut(posting.wallet)
        .ok_or(LedgerError::WalletNotFound(posting.wallet))?;
    wallet.balance = wallet
        .balance
        .checked_add(posting.amount)
        .ok_or(LedgerError::Overflow(posting.wallet))?;
    wallet.last_sync_at = Some(now);

    Ok(uow.append_entry(
        posting.wallet,
        posting.kind,
        posting.amount,
        Direction::Credit,
        posting.description,
        posting.reference,
        posting.created_by,
    ))
}

/// Override a balance, recording the difference as one `adjustment` entry.
///
/// Returns `None` when the balance already equals `new_balance`; a zero
/// amount entry would break the positive-amount rule.
pub fn set_balance(
    uow: &mut UnitOfWork<'_>,
    wallet_id: WalletId,
    new_balance: Points,
    reason: &str,
    created_by: CreatedBy,
) -> Result<Option<LedgerEntry>, LedgerError> {
    let now = uow.now();
    let wallet = uow
        .wallet_mut(wallet_id)
        .ok_or(LedgerError::WalletNotFound(wallet_id))?;
    let old_balance = wallet.balance;
    if old_balance == new_balance {
        return Ok(None);
    }
    let direction = if new_balance > old_balance {
        Direction::Credit
    } else {
        Direction::Debit
    };
    wallet.balance = new_balance;
    wallet.last_sync_at = Some(now);

    Ok(Some(uow.append_entry(
        wallet_id,
        EntryType::Adjustment,
        new_balance.abs_diff(old_balance),
        direction,
        format!("Reset wallet: {reason}"),
        None,
        created_by,
    )))
}

/// Top-level entry into the ledger core for callers without an enclosing unit.
///
/// Each call opens its own unit of work on the single wallet it touches.
pub struct Ledger<'a> {
    store: &'a Store,
    now: chrono::DateTime<chrono::Utc>,
}

impl<'a> Ledger<'a> {
    pub fn new(store: &'a Store, now: chrono::DateTime<chrono::Utc>) -> Self {
        Self { store, now }
    }

    pub fn debit(
        &self,
        wallet: WalletId,
        amount: i64,
        kind: EntryType,
        description: &str,
        reference: Option<u64>,
    ) -> Result<LedgerEntry, LedgerError> {
        let amount = Points::positive(amount).ok_or(LedgerError::InvalidAmount(amount))?;
        let mut uow = self.store.begin(LockSet::new().wallet(wallet), self.now);
        let entry = debit(
            &mut uow,
            Posting::new(wallet, amount, kind, description).reference(reference),
        )?;
        uow.commit()?;
        Ok(entry)
    }

    pub fn credit(
        &self,
        wallet: WalletId,
        amount: i64,
        kind: EntryType,
        description: &str,
        reference: Option<u64>,
    ) -> Result<LedgerEntry, LedgerError> {
        let amount = Points::positive(amount).ok_or(LedgerError::InvalidAmount(amount))?;
        let mut uow = self.store.begin(LockSet::new().wallet(wallet), self.now);
        let entry = credit(
            &mut uow,
            Posting::new(wallet, amount, kind, description).reference(reference),
        )?;
        uow.commit()?;
        Ok(entry)
    }

    pub fn set_balance(
        &self,
        wallet: WalletId,
        new_balance: i64,
        reason: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let new_balance =
            Points::non_negative(new_balance).ok_or(LedgerError::InvalidAmount(new_balance))?;
        let mut uow = self.store.begin(LockSet::new().wallet(wallet), self.now);
        let entry = set_balance(&mut uow, wallet, new_balance, reason, CreatedBy::Admin)?;
        uow.commit()?;
        Ok(entry)
    }
}
