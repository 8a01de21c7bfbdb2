//! Requests accepted by [`Engine::apply`](crate::Engine::apply) and what they produce.

use serde::{Deserialize, Serialize};

use crate::Points;
use crate::model::{
    Cart, Direction, LedgerEntry, PaymentToken, Product, ProductId, Role, SaleRecord, TokenType,
    UserId, WalletId,
};

/// One business request. Amounts arrive as signed integers and are
/// validated by the operation they reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Register {
        id: UserId,
        email: String,
        full_name: String,
        role: Role,
        password: String,
        pin: Option<String>,
    },
    /// Account carried over from the old system with plain-text secrets.
    ImportUser {
        id: UserId,
        email: String,
        full_name: String,
        role: Role,
        password: String,
        pin: Option<String>,
    },
    MigrateCredentials {
        admin: UserId,
    },
    Login {
        email: String,
        password: String,
    },
    SetPin {
        user: UserId,
        old_pin: Option<String>,
        new_pin: String,
    },
    ChangePassword {
        user: UserId,
        old_password: String,
        new_password: String,
    },
    ResetPassword {
        admin: UserId,
        user: UserId,
        password: String,
    },
    DeactivateUser {
        admin: UserId,
        user: UserId,
    },
    Adjust {
        admin: UserId,
        user: UserId,
        amount: i64,
        direction: Direction,
        #[serde(default)]
        description: String,
    },
    ResetBalance {
        admin: UserId,
        user: UserId,
        balance: i64,
        reason: String,
    },
    RewardMission {
        reviewer: UserId,
        user: UserId,
        mission: u64,
        title: String,
        amount: i64,
    },
    Transfer {
        from: UserId,
        to: UserId,
        amount: i64,
        #[serde(default)]
        description: String,
        pin: String,
    },
    CreateProduct {
        admin: UserId,
        name: String,
        #[serde(default)]
        description: String,
        price: i64,
        stock: i64,
    },
    UpdateProduct {
        admin: UserId,
        product: ProductId,
        name: Option<String>,
        description: Option<String>,
        price: Option<i64>,
        stock: Option<i64>,
    },
    DeactivateProduct {
        admin: UserId,
        product: ProductId,
    },
    Purchase {
        user: UserId,
        product: ProductId,
        quantity: i64,
        pin: String,
    },
    AddToCart {
        user: UserId,
        product: ProductId,
        quantity: i64,
    },
    UpdateCart {
        user: UserId,
        product: ProductId,
        quantity: i64,
    },
    RemoveFromCart {
        user: UserId,
        product: ProductId,
    },
    Checkout {
        user: UserId,
        pin: String,
    },
    IssueToken {
        user: UserId,
        amount: i64,
        merchant: String,
        #[serde(default)]
        kind: TokenType,
        /// `0` or absent: resolved at redemption.
        recipient: Option<UserId>,
        product: Option<ProductId>,
        ttl_secs: Option<u64>,
        /// Script-local name for the issued code.
        label: Option<String>,
    },
    LookupToken {
        token: String,
    },
    RedeemToken {
        token: String,
        user: UserId,
        pin: String,
    },
    ConsumeToken {
        token: String,
        user: UserId,
        amount: i64,
    },
}

impl Command {
    /// Short operation name used in logs and the audit trail.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Register { .. } => "register",
            Command::ImportUser { .. } => "import_user",
            Command::MigrateCredentials { .. } => "migrate_credentials",
            Command::Login { .. } => "login",
            Command::SetPin { .. } => "set_pin",
            Command::ChangePassword { .. } => "change_password",
            Command::ResetPassword { .. } => "reset_password",
            Command::DeactivateUser { .. } => "deactivate_user",
            Command::Adjust { .. } => "adjust",
            Command::ResetBalance { .. } => "reset_balance",
            Command::RewardMission { .. } => "reward_mission",
            Command::Transfer { .. } => "transfer",
            Command::CreateProduct { .. } => "create_product",
            Command::UpdateProduct { .. } => "update_product",
            Command::DeactivateProduct { .. } => "deactivate_product",
            Command::Purchase { .. } => "purchase",
            Command::AddToCart { .. } => "add_to_cart",
            Command::UpdateCart { .. } => "update_cart",
            Command::RemoveFromCart { .. } => "remove_from_cart",
            Command::Checkout { .. } => "checkout",
            Command::IssueToken { .. } => "issue_token",
            Command::LookupToken { .. } => "lookup_token",
            Command::RedeemToken { .. } => "redeem_token",
            Command::ConsumeToken { .. } => "consume_token",
        }
    }

    /// User on whose behalf the command runs, if any.
    pub fn actor(&self) -> Option<UserId> {
        match self {
            Command::Register { id, .. } | Command::ImportUser { id, .. } => Some(*id),
            Command::MigrateCredentials { admin }
            | Command::ResetPassword { admin, .. }
            | Command::DeactivateUser { admin, .. }
            | Command::Adjust { admin, .. }
            | Command::ResetBalance { admin, .. }
            | Command::CreateProduct { admin, .. }
            | Command::UpdateProduct { admin, .. }
            | Command::DeactivateProduct { admin, .. } => Some(*admin),
            Command::RewardMission { reviewer, .. } => Some(*reviewer),
            Command::Transfer { from, .. } => Some(*from),
            Command::SetPin { user, .. }
            | Command::ChangePassword { user, .. }
            | Command::Purchase { user, .. }
            | Command::AddToCart { user, .. }
            | Command::UpdateCart { user, .. }
            | Command::RemoveFromCart { user, .. }
            | Command::Checkout { user, .. }
            | Command::IssueToken { user, .. }
            | Command::RedeemToken { user, .. }
            | Command::ConsumeToken { user, .. } => Some(*user),
            Command::Login { .. } | Command::LookupToken { .. } => None,
        }
    }

    /// Token reference carried by the command, for label substitution.
    pub fn token_mut(&mut self) -> Option<&mut String> {
        match self {
            Command::LookupToken { token }
            | Command::RedeemToken { token, .. }
            | Command::ConsumeToken { token, .. } => Some(token),
            _ => None,
        }
    }
}

/// Both wallets of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferInfo {
    pub amount: Points,
    pub from_wallet: WalletId,
    pub to_wallet: WalletId,
    pub debit: LedgerEntry,
    pub credit: LedgerEntry,
}

/// Result of a purchase or checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub wallet: WalletId,
    pub total: Points,
    pub entries: Vec<LedgerEntry>,
    pub sales: Vec<SaleRecord>,
}

/// The two entries written by a token redemption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Redemption {
    pub token: PaymentToken,
    pub payer: LedgerEntry,
    pub recipient: LedgerEntry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Outcome {
    Registered { user: UserId, wallet: WalletId },
    Authenticated { user: UserId },
    CredentialsMigrated { users: usize },
    PinSet { user: UserId },
    UserUpdated { user: UserId },
    Posted { entry: LedgerEntry },
    BalanceReset {
        wallet: WalletId,
        entry: Option<LedgerEntry>,
    },
    Transferred(TransferInfo),
    ProductSaved { product: Product },
    CartUpdated { cart: Cart },
    Purchased(Receipt),
    TokenIssued { token: PaymentToken },
    Token { token: PaymentToken },
    Redeemed(Redemption),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_from_tagged_json() {
        let cmd: Command = serde_json::from_str(
            r#"{"op":"transfer","from":1,"to":2,"amount":100,"pin":"123456"}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::Transfer {
                from: 1,
                to: 2,
                amount: 100,
                description: String::new(),
                pin: "123456".into(),
            }
        );
        assert_eq!(cmd.name(), "transfer");
        assert_eq!(cmd.actor(), Some(1));
    }

    #[test]
    fn optional_fields_default_to_none() {
        let cmd: Command = serde_json::from_str(
            r#"{"op":"issue_token","user":4,"amount":200,"merchant":"Kantin"}"#,
        )
        .unwrap();
        let Command::IssueToken {
            kind,
            recipient,
            label,
            ..
        } = cmd
        else {
            panic!("wrong variant");
        };
        assert_eq!(kind, TokenType::Generic);
        assert_eq!(recipient, None);
        assert_eq!(label, None);
    }

    #[test]
    fn account_commands_name_their_actor() {
        let cmd: Command =
            serde_json::from_str(r#"{"op":"deactivate_user","admin":1,"user":9}"#).unwrap();
        assert_eq!(cmd, Command::DeactivateUser { admin: 1, user: 9 });
        assert_eq!(cmd.name(), "deactivate_user");
        assert_eq!(cmd.actor(), Some(1));

        let cmd: Command = serde_json::from_str(
            r#"{"op":"change_password","user":9,"old_password":"a","new_password":"b"}"#,
        )
        .unwrap();
        assert_eq!(cmd.actor(), Some(9));
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"op":"deposit","user":1}"#).is_err());
    }

    #[test]
    fn token_reference_is_exposed_for_substitution() {
        let mut cmd = Command::RedeemToken {
            token: "bill".into(),
            user: 2,
            pin: "1".into(),
        };
        *cmd.token_mut().unwrap() = "abcd".into();
        assert!(matches!(cmd, Command::RedeemToken { ref token, .. } if token == "abcd"));
        assert!(Command::Checkout { user: 1, pin: "1".into() }.token_mut().is_none());
    }
}
