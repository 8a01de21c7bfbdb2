//! Payment tokens: issue, look up and owner-side consume.
//!
//! Redemption, which moves money, lives with the other orchestrators in
//! [`crate::engine`]. Everything here shares [`derive_status`] so that expiry
//! is judged the same way on every path.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, info};

use crate::Points;
use crate::model::{PaymentToken, ProductId, TokenStatus, TokenType, UserId, WalletId};
use crate::store::{LockSet, Store, StoreError};

/// Random bytes behind every token code.
pub const CODE_BYTES: usize = 16;

/// Attempts at drawing a fresh code before giving up on a collision.
const ISSUE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("payment token not found")]
    NotFound,

    #[error("payment token is no longer active")]
    Invalid,

    #[error("payment token expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("payment token was not issued by wallet {0}")]
    NotOwned(WalletId),

    #[error("payment token is for {expected} points, not {presented}")]
    AmountMismatch { expected: Points, presented: i64 },

    #[error("amount must be a positive integer, got {0}")]
    InvalidAmount(i64),

    #[error("token lifetime must be positive and end within the calendar")]
    InvalidTtl,

    #[error("merchant name must not contain ':'")]
    InvalidMerchant,

    #[error("purchase token needs a product")]
    ProductRequired,

    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    #[error("recipient user {0} not found")]
    RecipientNotFound(UserId),

    #[error("wallet {0} not found")]
    WalletNotFound(WalletId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Effective status of a token at `now`.
///
/// An active token past its expiry is expired whether or not that has been
/// written back yet. Terminal states never change.
pub fn derive_status(token: &PaymentToken, now: DateTime<Utc>) -> TokenStatus {
    match token.status {
        TokenStatus::Active if now > token.expires_at => TokenStatus::Expired,
        status => status,
    }
}

/// Fail unless the token can still be spent at `now`.
pub fn ensure_spendable(token: &PaymentToken, now: DateTime<Utc>) -> Result<(), TokenError> {
    match derive_status(token, now) {
        TokenStatus::Active => Ok(()),
        TokenStatus::Expired => Err(TokenError::Expired(token.expires_at)),
        TokenStatus::Consumed => Err(TokenError::Invalid),
    }
}

/// 128-bit code from the OS RNG, hex encoded.
pub fn generate_code() -> String {
    let mut bytes = [0u8; CODE_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Content of the scannable code: `PREFIX:code:amount:merchant`.
pub fn qr_payload(prefix: &str, code: &str, amount: Points, merchant: &str) -> String {
    format!("{prefix}:{code}:{amount}:{merchant}")
}

/// Token lifetime from a whole number of seconds.
pub fn ttl_from_secs(secs: u64) -> Result<Duration, TokenError> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or(TokenError::InvalidTtl)
}

/// Short form of a code that is safe to log.
pub fn fingerprint(code: &str) -> &str {
    code.get(..8).unwrap_or(code)
}

/// Parameters of a new payment token.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub creator_wallet: WalletId,
    pub amount: i64,
    pub merchant: String,
    pub kind: TokenType,
    pub ttl: Duration,
    pub recipient: Option<UserId>,
    pub product: Option<ProductId>,
}

pub struct TokenService<'a> {
    store: &'a Store,
    qr_prefix: &'a str,
}

impl<'a> TokenService<'a> {
    pub fn new(store: &'a Store, qr_prefix: &'a str) -> Self {
        Self { store, qr_prefix }
    }

    pub fn issue(
        &self,
        request: IssueRequest,
        now: DateTime<Utc>,
    ) -> Result<PaymentToken, TokenError> {
        let amount =
            Points::positive(request.amount).ok_or(TokenError::InvalidAmount(request.amount))?;
        if request.merchant.contains(':') {
            return Err(TokenError::InvalidMerchant);
        }
        if request.ttl <= Duration::zero() {
            return Err(TokenError::InvalidTtl);
        }
        let expires_at = now
            .checked_add_signed(request.ttl)
            .ok_or(TokenError::InvalidTtl)?;
        if self.store.wallet(request.creator_wallet).is_none() {
            return Err(TokenError::WalletNotFound(request.creator_wallet));
        }
        if let Some(user) = request.recipient
            && self.store.user(user).is_none()
        {
            return Err(TokenError::RecipientNotFound(user));
        }
        let product = match (request.kind, request.product) {
            (TokenType::Purchase, None) => return Err(TokenError::ProductRequired),
            (_, Some(id)) if self.store.product(id).is_none() => {
                return Err(TokenError::ProductNotFound(id));
            }
            (_, product) => product,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let code = generate_code();
            let token = PaymentToken {
                qr_payload: qr_payload(self.qr_prefix, &code, amount, &request.merchant),
                code,
                amount,
                merchant: request.merchant.clone(),
                expires_at,
                creator_wallet_id: request.creator_wallet,
                recipient_user_id: request.recipient,
                kind: request.kind,
                product_id: product,
                status: TokenStatus::Active,
                created_at: now,
            };
            let mut uow = self.store.begin(LockSet::new(), now);
            uow.insert_token(token.clone());
            match uow.commit() {
                Ok(()) => {
                    info!(
                        token = fingerprint(&token.code),
                        wallet = token.creator_wallet_id,
                        amount = %token.amount,
                        kind = ?token.kind,
                        "payment token issued"
                    );
                    return Ok(token);
                }
                Err(StoreError::DuplicateToken) if attempt < ISSUE_ATTEMPTS => {
                    debug!(attempt, "token code collision, drawing again");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Current view of a token. An active token found past its expiry is
    /// written back as expired; repeated calls change nothing further.
    pub fn lookup(&self, code: &str, now: DateTime<Utc>) -> Result<PaymentToken, TokenError> {
        let mut uow = self.store.begin(LockSet::new().token(code), now);
        let token = uow.token(code).ok_or(TokenError::NotFound)?;
        let status = derive_status(token, now);
        if status == token.status {
            return Ok(token.clone());
        }

        let token = uow.token_mut(code).ok_or(TokenError::NotFound)?;
        token.status = status;
        let token = token.clone();
        uow.commit()?;
        debug!(token = fingerprint(code), "payment token marked expired");
        Ok(token)
    }

    /// Owner-side validate-and-consume: the creating wallet confirms the
    /// amount and retires the token without moving any points.
    pub fn consume_own(
        &self,
        code: &str,
        owner_wallet: WalletId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<PaymentToken, TokenError> {
        let mut uow = self.store.begin(LockSet::new().token(code), now);
        let token = uow.token(code).ok_or(TokenError::NotFound)?;
        ensure_spendable(token, now)?;
        if token.creator_wallet_id != owner_wallet {
            return Err(TokenError::NotOwned(owner_wallet));
        }
        if i64::try_from(token.amount.get()).ok() != Some(amount) {
            return Err(TokenError::AmountMismatch {
                expected: token.amount,
                presented: amount,
            });
        }

        let token = uow.token_mut(code).ok_or(TokenError::NotFound)?;
        token.status = TokenStatus::Consumed;
        let token = token.clone();
        uow.commit()?;
        Ok(token)
    }
}
