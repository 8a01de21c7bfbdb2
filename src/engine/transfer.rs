//! Peer-to-peer transfer.

use super::{Engine, EngineError};
use crate::Points;
use crate::command::TransferInfo;
use crate::ledger::{self, LedgerError, Posting};
use crate::model::{EntryType, UserId};
use crate::store::LockSet;

impl Engine {
    /// Move `amount` points from one user to another:
    /// - Verify the sender's PIN
    /// - Reject transfers to oneself
    /// - Lock both wallets, debit the sender, credit the receiver, commit
    pub fn transfer(
        &self,
        from: UserId,
        to: UserId,
        amount: i64,
        description: &str,
        pin: &str,
    ) -> Result<TransferInfo, EngineError> {
        self.verify_pin(from, pin)?;
        if from == to {
            return Err(EngineError::SelfTransfer(from));
        }
        let amount = Points::positive(amount).ok_or(LedgerError::InvalidAmount(amount))?;
        let from_wallet = self.wallet_of(from)?;
        let to_wallet = self.wallet_of(to)?;

        let mut uow = self.store.begin(
            LockSet::new().wallet(from_wallet).wallet(to_wallet),
            self.now(),
        );
        let debit = ledger::debit(
            &mut uow,
            Posting::new(
                from_wallet,
                amount,
                EntryType::TransferOut,
                format!("Transfer to user {to}: {description}"),
            ),
        )?;
        let credit = ledger::credit(
            &mut uow,
            Posting::new(
                to_wallet,
                amount,
                EntryType::TransferIn,
                format!("Transfer from user {from}: {description}"),
            ),
        )?;
        uow.commit()?;

        Ok(TransferInfo {
            amount,
            from_wallet,
            to_wallet,
            debit,
            credit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::{PIN, TestBed};
    use super::*;
    use crate::auth::AuthError;
    use crate::model::{Direction, Role};

    #[test]
    fn transfer_moves_points_between_wallets() {
        let bed = TestBed::new();
        let alice = bed.student(2, 300);
        let bob = bed.student(3, 0);

        let info = bed.engine.transfer(2, 3, 120, "lunch", PIN).unwrap();
        assert_eq!(info.amount, Points::new(120));
        assert_eq!((info.from_wallet, info.to_wallet), (alice, bob));
        assert_eq!(info.debit.kind, EntryType::TransferOut);
        assert_eq!(info.debit.direction, Direction::Debit);
        assert_eq!(info.credit.kind, EntryType::TransferIn);
        assert_eq!(info.credit.description, "Transfer from user 2: lunch");

        assert_eq!(bed.balance(alice), 180);
        assert_eq!(bed.balance(bob), 120);
        assert!(bed.engine.store().reconcile(alice).unwrap().is_consistent());
        assert!(bed.engine.store().reconcile(bob).unwrap().is_consistent());
    }

    #[test]
    fn self_transfer_is_rejected() {
        let bed = TestBed::new();
        let alice = bed.student(2, 300);
        let err = bed.engine.transfer(2, 2, 100, "", PIN).unwrap_err();
        assert!(matches!(err, EngineError::SelfTransfer(2)));
        assert_eq!(bed.balance(alice), 300);
        assert_eq!(bed.entries(alice), 1);
    }

    #[test]
    fn insufficient_balance_writes_nothing() {
        let bed = TestBed::new();
        let alice = bed.student(2, 50);
        let bob = bed.student(3, 0);
        let err = bed.engine.transfer(2, 3, 51, "", PIN).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::InsufficientBalance { .. })
        ));
        assert_eq!(bed.balance(alice), 50);
        assert_eq!(bed.entries(bob), 0);
    }

    #[test]
    fn wrong_pin_is_unauthorized() {
        let bed = TestBed::new();
        let alice = bed.student(2, 50);
        bed.student(3, 0);
        let err = bed.engine.transfer(2, 3, 10, "", "999999").unwrap_err();
        assert!(matches!(err, EngineError::Auth(AuthError::InvalidPin(2))));
        assert_eq!(bed.balance(alice), 50);
    }

    #[test]
    fn missing_receiver_wallet_is_reported() {
        let bed = TestBed::new();
        bed.student(2, 50);
        let err = bed.engine.transfer(2, 99, 10, "", PIN).unwrap_err();
        assert!(matches!(err, EngineError::NoWallet(99)));
    }

    #[test]
    fn non_positive_amount_is_invalid() {
        let bed = TestBed::new();
        bed.student(2, 50);
        bed.user(3, Role::Dosen);
        assert!(matches!(
            bed.engine.transfer(2, 3, 0, "", PIN),
            Err(EngineError::Ledger(LedgerError::InvalidAmount(0)))
        ));
    }
}
