//! Administrative balance changes, mission rewards and reports.

use serde::Serialize;
use tracing::info;

use super::{Engine, EngineError};
use crate::Points;
use crate::ledger::{self, LedgerError, Posting};
use crate::model::{
    CreatedBy, Direction, EntryStatus, EntryType, LedgerEntry, Role, UserId, UserStatus, WalletId,
};
use crate::store::{LockSet, Reconciliation};

/// One row of the leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Standing {
    pub user_id: UserId,
    pub full_name: String,
    pub wallet_id: WalletId,
    pub balance: Points,
}

/// Economy-wide totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Stats {
    pub users: usize,
    pub active_users: usize,
    pub circulating: Points,
    pub entries: usize,
    pub credited: Points,
    pub debited: Points,
    pub active_products: usize,
}

impl Engine {
    /// Credit or debit a user's wallet by hand.
    pub fn adjust(
        &self,
        admin: UserId,
        user: UserId,
        amount: i64,
        direction: Direction,
        description: &str,
    ) -> Result<LedgerEntry, EngineError> {
        self.require_role(admin, &[Role::Admin], "adjust balances")?;
        let amount = Points::positive(amount).ok_or(LedgerError::InvalidAmount(amount))?;
        let wallet = self.wallet_of(user)?;
        let description = match description.trim() {
            "" => "Manual adjustment",
            text => text,
        };

        let mut uow = self.store.begin(LockSet::new().wallet(wallet), self.now());
        let posting = Posting::new(wallet, amount, EntryType::Adjustment, description)
            .created_by(CreatedBy::Admin);
        let entry = match direction {
            Direction::Credit => ledger::credit(&mut uow, posting)?,
            Direction::Debit => ledger::debit(&mut uow, posting)?,
        };
        uow.commit()?;
        Ok(entry)
    }

    /// Force a wallet to `balance`. The difference is recorded as one adjustment.
    pub fn reset_balance(
        &self,
        admin: UserId,
        user: UserId,
        balance: i64,
        reason: &str,
    ) -> Result<(WalletId, Option<LedgerEntry>), EngineError> {
        self.require_role(admin, &[Role::Admin], "reset balances")?;
        let balance = Points::non_negative(balance).ok_or(LedgerError::InvalidAmount(balance))?;
        let wallet = self.wallet_of(user)?;

        let mut uow = self.store.begin(LockSet::new().wallet(wallet), self.now());
        let entry = ledger::set_balance(&mut uow, wallet, balance, reason, CreatedBy::Admin)?;
        uow.commit()?;
        info!(admin, wallet, %balance, "wallet balance reset");
        Ok((wallet, entry))
    }

    /// Pay out an approved mission submission.
    pub fn reward_mission(
        &self,
        reviewer: UserId,
        user: UserId,
        mission: u64,
        title: &str,
        amount: i64,
    ) -> Result<LedgerEntry, EngineError> {
        let reviewer = self.require_role(reviewer, &[Role::Dosen, Role::Admin], "reward missions")?;
        let amount = Points::positive(amount).ok_or(LedgerError::InvalidAmount(amount))?;
        let wallet = self.wallet_of(user)?;
        let created_by = match reviewer.role {
            Role::Admin => CreatedBy::Admin,
            _ => CreatedBy::Dosen,
        };

        let mut uow = self.store.begin(LockSet::new().wallet(wallet), self.now());
        let entry = ledger::credit(
            &mut uow,
            Posting::new(
                wallet,
                amount,
                EntryType::Mission,
                format!("Reward for mission: {title}"),
            )
            .reference(Some(mission))
            .created_by(created_by),
        )?;
        uow.commit()?;
        Ok(entry)
    }

    /// Entries of a wallet, newest first.
    pub fn history(&self, wallet: WalletId, limit: usize) -> Vec<LedgerEntry> {
        let mut entries = self.store.entries_for(wallet);
        entries.reverse();
        entries.truncate(limit);
        entries
    }

    /// Richest wallets of active users first; ties go to the lower user id.
    pub fn leaderboard(&self, limit: usize) -> Vec<Standing> {
        let mut standings: Vec<Standing> = self
            .store
            .wallets()
            .into_iter()
            .filter_map(|wallet| {
                let user = self.store.user(wallet.user_id)?;
                if user.status != UserStatus::Active {
                    return None;
                }
                Some(Standing {
                    user_id: user.id,
                    full_name: user.full_name,
                    wallet_id: wallet.id,
                    balance: wallet.balance,
                })
            })
            .collect();
        standings.sort_by(|a, b| b.balance.cmp(&a.balance).then(a.user_id.cmp(&b.user_id)));
        standings.truncate(limit);
        standings
    }

    pub fn stats(&self) -> Stats {
        let users = self.store.users();
        let (entries, credited, debited) = self.store.with_entries(|entries| {
            let mut credited = 0u64;
            let mut debited = 0u64;
            for entry in entries.iter().filter(|e| e.status == EntryStatus::Success) {
                match entry.direction {
                    Direction::Credit => credited = credited.saturating_add(entry.amount.get()),
                    Direction::Debit => debited = debited.saturating_add(entry.amount.get()),
                }
            }
            (entries.len(), credited, debited)
        });
        Stats {
            users: users.len(),
            active_users: users
                .iter()
                .filter(|u| u.status == UserStatus::Active)
                .count(),
            circulating: Points::new(
                self.store
                    .wallets()
                    .iter()
                    .fold(0u64, |acc, w| acc.saturating_add(w.balance.get())),
            ),
            entries,
            credited: Points::new(credited),
            debited: Points::new(debited),
            active_products: self
                .store
                .products()
                .iter()
                .filter(|p| p.is_active())
                .count(),
        }
    }

    /// Reconcile every wallet against its ledger.
    pub fn reconcile_all(&self) -> Vec<Reconciliation> {
        self.store
            .wallets()
            .iter()
            .filter_map(|wallet| self.store.reconcile(wallet.id))
            .collect()
    }
}
