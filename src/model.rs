//! Core domain types for the points economy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::Points;

/// User identifier, assigned by the account system.
pub type UserId = u64;

/// Wallet identifier.
pub type WalletId = u64;

/// Marketplace product identifier.
pub type ProductId = u64;

/// Ledger entry identifier.
pub type EntryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Dosen,
    Mahasiswa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Active,
    /// Deactivated by an admin; cannot log in or pay.
    Inactive,
}

/// A stored secret (login password or transaction PIN).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", content = "value", rename_all = "snake_case")]
pub enum Credential {
    /// Argon2 PHC string.
    Hashed(String),
    /// Imported from the old system before hashing was enforced. Never accepted
    /// for verification until rehashed.
    LegacyPlain(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub status: UserStatus,
    pub password: Option<Credential>,
    pub pin: Option<Credential>,
    pub created_at: DateTime<Utc>,
}

/// Per-user balance record. Only the ledger core mutates `balance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub user_id: UserId,
    pub balance: Points,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Adjustment,
    Marketplace,
    TransferIn,
    TransferOut,
    Mission,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryType::Adjustment => "adjustment",
            EntryType::Marketplace => "marketplace",
            EntryType::TransferIn => "transfer_in",
            EntryType::TransferOut => "transfer_out",
            EntryType::Mission => "mission",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Success,
    Failed,
}

/// Who initiated a balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatedBy {
    Admin,
    Dosen,
    #[default]
    System,
}

/// Immutable record of one balance-affecting event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub wallet_id: WalletId,
    pub kind: EntryType,
    pub amount: Points,
    pub direction: Direction,
    pub status: EntryStatus,
    pub description: String,
    pub reference_id: Option<u64>,
    pub created_by: CreatedBy,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Signed contribution of this entry to its wallet's balance.
    pub fn signed_amount(&self) -> i128 {
        let amount = i128::from(self.amount.get());
        match (self.status, self.direction) {
            (EntryStatus::Failed, _) => 0,
            (EntryStatus::Success, Direction::Credit) => amount,
            (EntryStatus::Success, Direction::Debit) => -amount,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub description: String,
    pub price: Points,
    pub stock: u32,
    pub status: ProductStatus,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn is_active(&self) -> bool {
        self.status == ProductStatus::Active
    }
}

/// One line of a user's cart; `(user, product)` is unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: ProductId,
    pub quantity: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub user_id: UserId,
    pub items: Vec<CartItem>,
}

impl Cart {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            items: Vec::new(),
        }
    }

    /// Adds to an existing line instead of duplicating it.
    pub fn add(&mut self, product_id: ProductId, quantity: u32) {
        match self.items.iter_mut().find(|i| i.product_id == product_id) {
            Some(item) => item.quantity = item.quantity.saturating_add(quantity),
            None => self.items.push(CartItem {
                product_id,
                quantity,
            }),
        }
    }

    /// Sets a line's quantity; zero removes it. Returns false if the line is absent.
    pub fn set_quantity(&mut self, product_id: ProductId, quantity: u32) -> bool {
        let Some(pos) = self.items.iter().position(|i| i.product_id == product_id) else {
            return false;
        };
        if quantity == 0 {
            self.items.remove(pos);
        } else {
            self.items[pos].quantity = quantity;
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Marketplace sale, recorded alongside the debit of a purchase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub id: u64,
    pub wallet_id: WalletId,
    pub product_id: ProductId,
    pub unit_price: Points,
    pub quantity: u32,
    pub total: Points,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    #[default]
    Generic,
    Transfer,
    Purchase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Active,
    Consumed,
    Expired,
}

/// Single-use, time-boxed bearer credential redeemable for a fixed amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentToken {
    pub code: String,
    pub qr_payload: String,
    pub amount: Points,
    pub merchant: String,
    pub expires_at: DateTime<Utc>,
    pub creator_wallet_id: WalletId,
    /// `None` means the recipient is resolved at redemption time.
    pub recipient_user_id: Option<UserId>,
    pub kind: TokenType,
    pub product_id: Option<ProductId>,
    pub status: TokenStatus,
    pub created_at: DateTime<Utc>,
}
