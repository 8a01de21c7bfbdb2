//! Error types for engine operations.

use thiserror::Error;

use crate::auth::AuthError;
use crate::ledger::LedgerError;
use crate::model::{ProductId, Role, UserId};
use crate::store::StoreError;
use crate::token::TokenError;

/// Coarse classification of a failure, for callers deciding what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input; retrying the same request cannot succeed.
    Validation,
    /// Bad PIN or credential, or a role that may not do this.
    Unauthorized,
    NotFound,
    /// The request contradicts current state (self-transfer, spent token, inactive product).
    Conflict,
    /// A business rule said no (balance, stock, empty cart).
    Rejected,
    /// Storage or hashing fault; nothing was committed, the whole operation may be retried.
    System,
}

/// Top-level error returned by [`Engine::apply`](super::Engine::apply).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),

    #[error("authorization: {0}")]
    Auth(#[from] AuthError),

    #[error("token: {0}")]
    Token(#[from] TokenError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Marketplace(#[from] MarketplaceError),

    #[error("invalid input: {0}")]
    Validation(&'static str),

    #[error("user {0} cannot transfer to themselves")]
    SelfTransfer(UserId),

    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("user {0} has no wallet")]
    NoWallet(UserId),

    #[error("user {user} ({role:?}) may not {action}")]
    Forbidden {
        user: UserId,
        role: Role,
        action: &'static str,
    },

    #[error("no administrator account to receive the payment")]
    NoFallbackRecipient,

    #[error("{0} kept changing, giving up")]
    Conflict(&'static str),
}

/// Errors from product, cart and purchase operations.
#[derive(Debug, Error)]
pub enum MarketplaceError {
    #[error("product {0} not found")]
    ProductNotFound(ProductId),

    #[error("product {0} is not active")]
    ProductInactive(ProductId),

    #[error("product {product} out of stock: {available} left, {requested} requested")]
    OutOfStock {
        product: ProductId,
        available: u32,
        requested: u32,
    },

    #[error("quantity must be at least 1, got {0}")]
    InvalidQuantity(i64),

    #[error("price must be a positive integer, got {0}")]
    InvalidPrice(i64),

    #[error("stock must be a non-negative integer, got {0}")]
    InvalidStock(i64),

    #[error("cart of user {0} is empty")]
    EmptyCart(UserId),

    #[error("product {product} is not in the cart of user {user}")]
    NotInCart { user: UserId, product: ProductId },

    #[error("total price overflows")]
    TotalOverflow,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Ledger(e) => match e {
                LedgerError::InvalidAmount(_) => ErrorKind::Validation,
                LedgerError::InsufficientBalance { .. } | LedgerError::Overflow(_) => {
                    ErrorKind::Rejected
                }
                LedgerError::WalletNotFound(_) => ErrorKind::NotFound,
                LedgerError::Store(e) => store_kind(e),
            },
            EngineError::Auth(e) => match e {
                AuthError::UserNotFound(_) => ErrorKind::NotFound,
                AuthError::Hash(_) => ErrorKind::System,
                AuthError::Store(e) => store_kind(e),
                _ => ErrorKind::Unauthorized,
            },
            EngineError::Token(e) => match e {
                TokenError::InvalidAmount(_)
                | TokenError::InvalidTtl
                | TokenError::InvalidMerchant
                | TokenError::ProductRequired
                | TokenError::AmountMismatch { .. } => ErrorKind::Validation,
                TokenError::NotFound
                | TokenError::ProductNotFound(_)
                | TokenError::RecipientNotFound(_)
                | TokenError::WalletNotFound(_) => ErrorKind::NotFound,
                TokenError::Invalid | TokenError::NotOwned(_) => ErrorKind::Conflict,
                TokenError::Expired(_) => ErrorKind::Rejected,
                TokenError::Store(e) => store_kind(e),
            },
            EngineError::Store(e) => store_kind(e),
            EngineError::Marketplace(e) => match e {
                MarketplaceError::ProductNotFound(_) | MarketplaceError::NotInCart { .. } => {
                    ErrorKind::NotFound
                }
                MarketplaceError::ProductInactive(_) => ErrorKind::Conflict,
                MarketplaceError::OutOfStock { .. }
                | MarketplaceError::EmptyCart(_)
                | MarketplaceError::TotalOverflow => ErrorKind::Rejected,
                MarketplaceError::InvalidQuantity(_)
                | MarketplaceError::InvalidPrice(_)
                | MarketplaceError::InvalidStock(_) => ErrorKind::Validation,
            },
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::SelfTransfer(_) | EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::UserNotFound(_)
            | EngineError::NoWallet(_)
            | EngineError::NoFallbackRecipient => ErrorKind::NotFound,
            EngineError::Forbidden { .. } => ErrorKind::Unauthorized,
        }
    }

    /// Only system faults are worth retrying; nothing partial was committed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::System
    }
}

fn store_kind(e: &StoreError) -> ErrorKind {
    if e.is_system() {
        ErrorKind::System
    } else {
        ErrorKind::Conflict
    }
}
