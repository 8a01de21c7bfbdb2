//! Payment tokens from the engine's side: issuing on behalf of a user,
//! lookups, owner-side consume and redemption.

use chrono::Duration;
use tracing::{info, warn};

use super::marketplace::take_stock;
use super::{Engine, EngineError};
use crate::command::Redemption;
use crate::ledger::{self, Posting};
use crate::model::{EntryType, PaymentToken, ProductId, TokenStatus, TokenType, UserId, WalletId};
use crate::store::LockSet;
use crate::token::{self, IssueRequest, TokenError, TokenService};

/// What a user asks for when creating a payment request.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub amount: i64,
    pub merchant: String,
    pub kind: TokenType,
    /// `None` or `Some(0)`: the recipient is resolved at redemption.
    pub recipient: Option<UserId>,
    pub product: Option<ProductId>,
    /// Falls back to the configured lifetime.
    pub ttl: Option<Duration>,
}

impl Engine {
    /// Issue a token bound to `user`'s wallet.
    pub fn issue_token(
        &self,
        user: UserId,
        request: TokenRequest,
    ) -> Result<PaymentToken, EngineError> {
        let creator_wallet = self.wallet_of(user)?;
        let request = IssueRequest {
            creator_wallet,
            amount: request.amount,
            merchant: request.merchant,
            kind: request.kind,
            ttl: request.ttl.unwrap_or_else(|| self.config.token_ttl()),
            recipient: request.recipient.filter(|id| *id != 0),
            product: request.product,
        };
        Ok(self.tokens().issue(request, self.now())?)
    }

    pub fn lookup_token(&self, code: &str) -> Result<PaymentToken, EngineError> {
        Ok(self.tokens().lookup(code, self.now())?)
    }

    /// The creator retires its own token after checking the amount. No points move.
    pub fn consume_token(
        &self,
        code: &str,
        user: UserId,
        amount: i64,
    ) -> Result<PaymentToken, EngineError> {
        let wallet = self.wallet_of(user)?;
        Ok(self.tokens().consume_own(code, wallet, amount, self.now())?)
    }

    /// Pay a token from `redeemer`'s wallet to the token's recipient.
    ///
    /// The token row is locked with both wallets (and the product of a
    /// purchase token), so of two concurrent redeemers exactly one sees an
    /// active token. Expiry is checked again right before commit.
    pub fn redeem(
        &self,
        code: &str,
        redeemer: UserId,
        pin: &str,
    ) -> Result<Redemption, EngineError> {
        self.verify_pin(redeemer, pin)?;

        let snapshot = self.store.token(code).ok_or(TokenError::NotFound)?;
        token::ensure_spendable(&snapshot, self.now())?;
        let payer_wallet = self.wallet_of(redeemer)?;
        let recipient = self.resolve_recipient(&snapshot)?;
        let recipient_wallet = self.recipient_wallet(recipient)?;

        let mut locks = LockSet::new()
            .token(code)
            .wallet(payer_wallet)
            .wallet(recipient_wallet);
        if snapshot.kind == TokenType::Purchase
            && let Some(product) = snapshot.product_id
        {
            locks = locks.product(product);
        }
        let mut uow = self.store.begin(locks, self.now());

        // the snapshot may be stale; only the locked row counts
        let current = uow.token(code).ok_or(TokenError::NotFound)?.clone();
        token::ensure_spendable(&current, uow.now())?;

        let (payer_kind, recipient_kind) = match current.kind {
            TokenType::Transfer => (EntryType::TransferOut, EntryType::TransferIn),
            TokenType::Purchase | TokenType::Generic => {
                (EntryType::Marketplace, EntryType::Marketplace)
            }
        };
        let reference = current
            .product_id
            .filter(|_| current.kind == TokenType::Purchase);
        // read under the unit's lock; the store would block on our own guard
        let product_name = reference
            .and_then(|id| uow.product(id))
            .map(|product| product.name.clone());
        let (payer_text, recipient_text) =
            descriptions(&current, product_name, redeemer, recipient);

        let payer = ledger::debit(
            &mut uow,
            Posting::new(payer_wallet, current.amount, payer_kind, payer_text).reference(reference),
        )?;
        let credit = ledger::credit(
            &mut uow,
            Posting::new(recipient_wallet, current.amount, recipient_kind, recipient_text)
                .reference(reference),
        )?;
        if let Some(product) = reference {
            take_stock(&mut uow, product, 1)?;
        }
        let token = uow.token_mut(code).ok_or(TokenError::NotFound)?;
        token.status = TokenStatus::Consumed;
        let token = token.clone();

        let now = self.now();
        if now > token.expires_at {
            return Err(TokenError::Expired(token.expires_at).into());
        }
        uow.commit()?;

        info!(
            token = token::fingerprint(code),
            payer = payer_wallet,
            recipient = recipient_wallet,
            amount = %token.amount,
            "payment token redeemed"
        );
        Ok(Redemption {
            token,
            payer,
            recipient: credit,
        })
    }
}

/// Private API
impl Engine {
    fn tokens(&self) -> TokenService<'_> {
        TokenService::new(&self.store, &self.config.qr_prefix)
    }

    /// Addressed recipient, or the first administrator for open tokens.
    fn resolve_recipient(&self, token: &PaymentToken) -> Result<UserId, EngineError> {
        let recipient = match token.recipient_user_id {
            Some(user) => user,
            None => self
                .store
                .first_admin()
                .ok_or(EngineError::NoFallbackRecipient)?,
        };
        self.require_user(recipient)?;
        Ok(recipient)
    }

    /// Wallet of the recipient, opened on the spot if the account never got one.
    fn recipient_wallet(&self, recipient: UserId) -> Result<WalletId, EngineError> {
        if let Some(wallet) = self.store.wallet_of(recipient) {
            return Ok(wallet);
        }
        warn!(user = recipient, "token recipient has no wallet, creating one");
        Ok(self.store.ensure_wallet(recipient, self.now())?)
    }
}

/// Payer and recipient entry descriptions for a redeemed token.
fn descriptions(
    token: &PaymentToken,
    product_name: Option<String>,
    payer: UserId,
    recipient: UserId,
) -> (String, String) {
    match token.kind {
        TokenType::Transfer => (
            format!("QR transfer to user #{recipient}"),
            format!("QR transfer from user #{payer}"),
        ),
        TokenType::Purchase => {
            let name = product_name.unwrap_or_else(|| token.merchant.clone());
            (
                format!("Purchase: {name}"),
                format!("Sale: {name} to user #{payer}"),
            )
        }
        TokenType::Generic => (
            format!("QR payment: {}", token.merchant),
            format!("QR payment from user #{payer}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::super::testkit::{PIN, TestBed};
    use super::*;
    use crate::Points;
    use crate::engine::MarketplaceError;
    use crate::ledger::LedgerError;
    use crate::clock::Clock;
    use crate::model::{Direction, Role};
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Moves forward by `step` every time it is read.
    struct TickingClock {
        now: Mutex<DateTime<Utc>>,
        step: Duration,
    }

    impl Clock for TickingClock {
        fn now(&self) -> DateTime<Utc> {
            let mut now = self.now.lock();
            let current = *now;
            *now += self.step;
            current
        }
    }

    fn request(amount: i64, kind: TokenType) -> TokenRequest {
        TokenRequest {
            amount,
            merchant: "Kantin".into(),
            kind,
            recipient: None,
            product: None,
            ttl: None,
        }
    }

    #[test]
    fn generic_token_pays_the_first_admin() {
        let bed = TestBed::new();
        let admin = bed.admin();
        let merchant = bed.student(2, 0);
        let payer = bed.student(3, 500);
        let admin_wallet = bed.engine.store().wallet_of(admin).unwrap();

        let token = bed
            .engine
            .issue_token(2, request(200, TokenType::Generic))
            .unwrap();
        assert_eq!(token.creator_wallet_id, merchant);
        assert!(token.qr_payload.starts_with("WPT:"));

        let redemption = bed.engine.redeem(&token.code, 3, PIN).unwrap();
        assert_eq!(redemption.token.status, TokenStatus::Consumed);
        assert_eq!(redemption.payer.kind, EntryType::Marketplace);
        assert_eq!(redemption.payer.direction, Direction::Debit);
        assert_eq!(redemption.recipient.wallet_id, admin_wallet);
        assert_eq!(bed.balance(payer), 300);
        assert_eq!(bed.balance(admin_wallet), 200);
        assert_eq!(bed.balance(merchant), 0);
    }

    #[test]
    fn transfer_token_uses_transfer_entry_types() {
        let bed = TestBed::new();
        let alice = bed.student(2, 0);
        let bob = bed.student(3, 100);

        let mut req = request(40, TokenType::Transfer);
        req.recipient = Some(2);
        let token = bed.engine.issue_token(2, req).unwrap();
        let redemption = bed.engine.redeem(&token.code, 3, PIN).unwrap();

        assert_eq!(redemption.payer.kind, EntryType::TransferOut);
        assert_eq!(redemption.recipient.kind, EntryType::TransferIn);
        assert_eq!(redemption.payer.description, "QR transfer to user #2");
        assert_eq!(bed.balance(alice), 40);
        assert_eq!(bed.balance(bob), 60);
    }

    #[test]
    fn expired_token_moves_nothing() {
        let bed = TestBed::new();
        bed.admin();
        let merchant = bed.student(2, 0);
        let payer = bed.student(3, 500);
        let token = bed
            .engine
            .issue_token(2, request(200, TokenType::Generic))
            .unwrap();

        bed.clock.advance(Duration::minutes(11));
        let err = bed.engine.redeem(&token.code, 3, PIN).unwrap_err();
        assert!(matches!(err, EngineError::Token(TokenError::Expired(_))));
        assert_eq!(bed.balance(payer), 500);
        assert_eq!(bed.balance(merchant), 0);
        assert_eq!(bed.entries(payer), 1);
    }

    #[test]
    fn expiry_during_redemption_rolls_back() {
        let bed = TestBed::new();
        let admin = bed.admin();
        bed.student(2, 0);
        let payer = bed.student(3, 500);
        let admin_wallet = bed.engine.store().wallet_of(admin).unwrap();
        let token = bed
            .engine
            .issue_token(2, request(200, TokenType::Generic))
            .unwrap();

        // still valid when fetched and when locked, past expiry by commit time
        let engine = bed.engine.with_clock(Arc::new(TickingClock {
            now: Mutex::new(token.expires_at - Duration::milliseconds(1500)),
            step: Duration::seconds(1),
        }));
        let err = engine.redeem(&token.code, 3, PIN).unwrap_err();
        assert!(matches!(err, EngineError::Token(TokenError::Expired(_))));

        let store = engine.store();
        assert_eq!(store.wallet(payer).unwrap().balance.get(), 500);
        assert_eq!(store.wallet(admin_wallet).unwrap().balance.get(), 0);
        assert_eq!(store.entries_for(payer).len(), 1);
        assert_eq!(
            store.token(&token.code).unwrap().status,
            TokenStatus::Active
        );
    }

    #[test]
    fn second_redemption_is_invalid() {
        let bed = TestBed::new();
        bed.admin();
        bed.student(2, 0);
        let payer = bed.student(3, 500);
        let token = bed
            .engine
            .issue_token(2, request(100, TokenType::Generic))
            .unwrap();

        bed.engine.redeem(&token.code, 3, PIN).unwrap();
        let err = bed.engine.redeem(&token.code, 3, PIN).unwrap_err();
        assert!(matches!(err, EngineError::Token(TokenError::Invalid)));
        assert_eq!(bed.balance(payer), 400);
    }

    #[test]
    fn insufficient_balance_leaves_token_active() {
        let bed = TestBed::new();
        bed.admin();
        bed.student(2, 0);
        bed.student(3, 50);
        let token = bed
            .engine
            .issue_token(2, request(100, TokenType::Generic))
            .unwrap();

        let err = bed.engine.redeem(&token.code, 3, PIN).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::InsufficientBalance { .. })
        ));
        assert_eq!(
            bed.engine.store().token(&token.code).unwrap().status,
            TokenStatus::Active
        );
    }

    #[test]
    fn purchase_token_takes_one_from_stock() {
        let bed = TestBed::new();
        let admin = bed.admin();
        bed.student(3, 500);
        let product = bed.product(150, 2);

        let mut req = request(150, TokenType::Purchase);
        req.product = Some(product);
        let token = bed.engine.issue_token(admin, req).unwrap();
        let redemption = bed.engine.redeem(&token.code, 3, PIN).unwrap();

        assert_eq!(redemption.payer.reference_id, Some(product));
        assert_eq!(redemption.payer.description, "Purchase: Item 150");
        assert_eq!(redemption.recipient.description, "Sale: Item 150 to user #3");
        assert_eq!(bed.stock(product), 1);
    }

    #[test]
    fn purchase_token_without_stock_rolls_back_payment() {
        let bed = TestBed::new();
        let admin = bed.admin();
        let payer = bed.student(3, 500);
        let product = bed.product(150, 1);
        let admin_wallet = bed.engine.store().wallet_of(admin).unwrap();

        let mut req = request(150, TokenType::Purchase);
        req.product = Some(product);
        let token = bed.engine.issue_token(admin, req).unwrap();
        bed.engine
            .update_product(
                admin,
                product,
                super::super::ProductPatch {
                    stock: Some(0),
                    ..Default::default()
                },
            )
            .unwrap();

        let err = bed.engine.redeem(&token.code, 3, PIN).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Marketplace(MarketplaceError::OutOfStock { .. })
        ));
        assert_eq!(bed.balance(payer), 500);
        assert_eq!(bed.balance(admin_wallet), 0);
        assert_eq!(
            bed.engine.store().token(&token.code).unwrap().status,
            TokenStatus::Active
        );
    }

    #[test]
    fn open_token_without_any_admin_fails() {
        let bed = TestBed::new();
        bed.student(2, 0);
        bed.student(3, 500);
        let token = bed
            .engine
            .issue_token(2, request(100, TokenType::Generic))
            .unwrap();
        assert!(matches!(
            bed.engine.redeem(&token.code, 3, PIN),
            Err(EngineError::NoFallbackRecipient)
        ));
    }

    #[test]
    fn addressed_recipient_without_wallet_gets_one() {
        let bed = TestBed::new();
        bed.student(2, 0);
        let payer = bed.student(3, 500);
        // a user row with no wallet, as left behind by the old system
        {
            let store = bed.engine.store();
            let mut uow = store.begin(LockSet::new(), chrono::Utc::now());
            uow.insert_user(crate::model::User {
                id: 9,
                email: "orphan@campus.test".into(),
                full_name: "Orphan".into(),
                role: Role::Dosen,
                status: Default::default(),
                password: None,
                pin: None,
                created_at: chrono::Utc::now(),
            });
            uow.commit().unwrap();
        }

        let mut req = request(70, TokenType::Generic);
        req.recipient = Some(9);
        let token = bed.engine.issue_token(2, req).unwrap();
        let redemption = bed.engine.redeem(&token.code, 3, PIN).unwrap();

        let wallet = bed.engine.store().wallet_of(9).unwrap();
        assert_eq!(redemption.recipient.wallet_id, wallet);
        assert_eq!(bed.balance(wallet), 70);
        assert_eq!(bed.balance(payer), 430);
    }

    #[test]
    fn lookup_after_expiry_is_idempotent() {
        let bed = TestBed::new();
        bed.student(2, 0);
        let token = bed
            .engine
            .issue_token(2, request(10, TokenType::Generic))
            .unwrap();
        bed.clock.advance(Duration::minutes(11));

        let first = bed.engine.lookup_token(&token.code).unwrap();
        let seq = bed.engine.store().seq();
        let second = bed.engine.lookup_token(&token.code).unwrap();
        assert_eq!(first.status, TokenStatus::Expired);
        assert_eq!(second.status, TokenStatus::Expired);
        assert_eq!(bed.engine.store().seq(), seq);
    }

    #[test]
    fn zero_recipient_means_unaddressed() {
        let bed = TestBed::new();
        bed.student(2, 0);
        let mut req = request(10, TokenType::Generic);
        req.recipient = Some(0);
        req.ttl = Some(Duration::seconds(30));
        let token = bed.engine.issue_token(2, req).unwrap();
        assert_eq!(token.recipient_user_id, None);
        assert_eq!(token.expires_at - token.created_at, Duration::seconds(30));
    }

    #[test]
    fn owner_consumes_own_token() {
        let bed = TestBed::new();
        bed.student(2, 0);
        bed.student(3, 0);
        let token = bed
            .engine
            .issue_token(2, request(25, TokenType::Generic))
            .unwrap();

        assert!(matches!(
            bed.engine.consume_token(&token.code, 3, 25),
            Err(EngineError::Token(TokenError::NotOwned(_)))
        ));
        let consumed = bed.engine.consume_token(&token.code, 2, 25).unwrap();
        assert_eq!(consumed.status, TokenStatus::Consumed);
        assert_eq!(consumed.amount, Points::new(25));
    }
}
