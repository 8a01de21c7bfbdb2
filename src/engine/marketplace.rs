//! Marketplace: products, carts, single purchases and checkout.

use serde::Serialize;
use tracing::debug;

use super::{Engine, EngineError, MarketplaceError};
use crate::Points;
use crate::command::Receipt;
use crate::ledger::{self, LedgerError, Posting};
use crate::model::{
    Cart, EntryType, LedgerEntry, Product, ProductId, ProductStatus, Role, SaleRecord, UserId,
    WalletId,
};
use crate::store::{LockSet, NewProduct, UnitOfWork};

/// Times checkout re-plans its locks when the cart changes underneath it.
const CHECKOUT_ATTEMPTS: usize = 3;

/// Fields to change on a product; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<i64>,
    pub stock: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartLine {
    pub product_id: ProductId,
    pub name: String,
    pub unit_price: Points,
    pub quantity: u32,
    pub line_total: Points,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartView {
    pub user_id: UserId,
    pub lines: Vec<CartLine>,
    pub total: Points,
}

/// Products
impl Engine {
    pub fn create_product(
        &self,
        admin: UserId,
        name: &str,
        description: &str,
        price: i64,
        stock: i64,
    ) -> Result<Product, EngineError> {
        self.require_role(admin, &[Role::Admin], "create products")?;
        let name = validate_name(name)?;
        let price = Points::positive(price).ok_or(MarketplaceError::InvalidPrice(price))?;
        let stock = u32::try_from(stock).map_err(|_| MarketplaceError::InvalidStock(stock))?;

        let mut uow = self.store.begin(LockSet::new(), self.now());
        let product = uow.insert_product(NewProduct {
            name,
            description: description.trim().to_string(),
            price,
            stock,
            created_by: admin,
        });
        uow.commit()?;
        Ok(product)
    }

    pub fn update_product(
        &self,
        admin: UserId,
        id: ProductId,
        patch: ProductPatch,
    ) -> Result<Product, EngineError> {
        self.require_role(admin, &[Role::Admin], "update products")?;
        let name = patch.name.as_deref().map(validate_name).transpose()?;
        let price = patch
            .price
            .map(|p| Points::positive(p).ok_or(MarketplaceError::InvalidPrice(p)))
            .transpose()?;
        let stock = patch
            .stock
            .map(|s| u32::try_from(s).map_err(|_| MarketplaceError::InvalidStock(s)))
            .transpose()?;

        let mut uow = self.store.begin(LockSet::new().product(id), self.now());
        let product = uow
            .product_mut(id)
            .ok_or(MarketplaceError::ProductNotFound(id))?;
        if let Some(name) = name {
            product.name = name;
        }
        if let Some(description) = patch.description {
            product.description = description.trim().to_string();
        }
        if let Some(price) = price {
            product.price = price;
        }
        if let Some(stock) = stock {
            product.stock = stock;
        }
        let product = product.clone();
        uow.commit()?;
        Ok(product)
    }

    /// Soft delete: the product stays for sale history but can no longer be bought.
    pub fn deactivate_product(&self, admin: UserId, id: ProductId) -> Result<Product, EngineError> {
        self.require_role(admin, &[Role::Admin], "deactivate products")?;
        let mut uow = self.store.begin(LockSet::new().product(id), self.now());
        let product = uow
            .product_mut(id)
            .ok_or(MarketplaceError::ProductNotFound(id))?;
        product.status = ProductStatus::Inactive;
        let product = product.clone();
        uow.commit()?;
        Ok(product)
    }
}

/// Cart
impl Engine {
    /// Add to the user's cart; adding a product already there raises its quantity.
    pub fn add_to_cart(
        &self,
        user: UserId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<Cart, EngineError> {
        let quantity = validate_quantity(quantity)?;
        self.require_user(user)?;

        let mut uow = self
            .store
            .begin(LockSet::new().cart(user).product(product_id), self.now());
        let product = uow
            .product(product_id)
            .ok_or(MarketplaceError::ProductNotFound(product_id))?;
        let already = uow
            .cart(user)
            .and_then(|cart| cart.items.iter().find(|i| i.product_id == product_id))
            .map_or(0, |item| item.quantity);
        check_line(product, already.saturating_add(quantity))?;

        let cart = uow
            .cart_mut(user)
            .ok_or(EngineError::Conflict("cart"))?;
        cart.add(product_id, quantity);
        let cart = cart.clone();
        uow.commit()?;
        Ok(cart)
    }

    /// Set a line's quantity; zero removes the line.
    pub fn update_cart_item(
        &self,
        user: UserId,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<Cart, EngineError> {
        let quantity =
            u32::try_from(quantity).map_err(|_| MarketplaceError::InvalidQuantity(quantity))?;
        let mut uow = self
            .store
            .begin(LockSet::new().cart(user).product(product_id), self.now());
        if quantity > 0 {
            let product = uow
                .product(product_id)
                .ok_or(MarketplaceError::ProductNotFound(product_id))?;
            if product.stock < quantity {
                return Err(MarketplaceError::OutOfStock {
                    product: product_id,
                    available: product.stock,
                    requested: quantity,
                }
                .into());
            }
        }

        let cart = uow
            .cart_mut(user)
            .ok_or(EngineError::Conflict("cart"))?;
        if !cart.set_quantity(product_id, quantity) {
            return Err(MarketplaceError::NotInCart {
                user,
                product: product_id,
            }
            .into());
        }
        let cart = cart.clone();
        uow.commit()?;
        Ok(cart)
    }

    pub fn remove_from_cart(&self, user: UserId, product_id: ProductId) -> Result<Cart, EngineError> {
        let mut uow = self.store.begin(LockSet::new().cart(user), self.now());
        let cart = uow
            .cart_mut(user)
            .ok_or(EngineError::Conflict("cart"))?;
        if !cart.set_quantity(product_id, 0) {
            return Err(MarketplaceError::NotInCart {
                user,
                product: product_id,
            }
            .into());
        }
        let cart = cart.clone();
        uow.commit()?;
        Ok(cart)
    }

    /// Priced view of the cart. Lines whose product vanished are skipped.
    pub fn cart(&self, user: UserId) -> CartView {
        let cart = self.store.cart(user);
        let lines: Vec<CartLine> = cart
            .items
            .iter()
            .filter_map(|item| {
                let product = self.store.product(item.product_id)?;
                Some(CartLine {
                    product_id: product.id,
                    line_total: product
                        .price
                        .checked_mul(item.quantity)
                        .unwrap_or(Points::new(u64::MAX)),
                    name: product.name,
                    unit_price: product.price,
                    quantity: item.quantity,
                })
            })
            .collect();
        let total = lines
            .iter()
            .try_fold(Points::ZERO, |acc, line| acc.checked_add(line.line_total))
            .unwrap_or(Points::new(u64::MAX));
        CartView {
            user_id: user,
            lines,
            total,
        }
    }
}

/// Purchases
impl Engine {
    /// Buy `quantity` of one product:
    /// - Verify the buyer's PIN
    /// - Lock wallet and product, check the product is active and in stock
    /// - Debit `price * quantity`, take the stock, record the sale, commit
    pub fn purchase(
        &self,
        user: UserId,
        product_id: ProductId,
        quantity: i64,
        pin: &str,
    ) -> Result<Receipt, EngineError> {
        let quantity = validate_quantity(quantity)?;
        self.verify_pin(user, pin)?;
        let wallet = self.wallet_of(user)?;

        let mut uow = self
            .store
            .begin(LockSet::new().wallet(wallet).product(product_id), self.now());
        let product = uow
            .product(product_id)
            .ok_or(MarketplaceError::ProductNotFound(product_id))?
            .clone();
        check_line(&product, quantity)?;

        let (entry, sale) = buy_line(&mut uow, wallet, &product, quantity)?;
        let total = sale.total;
        uow.commit()?;

        Ok(Receipt {
            wallet,
            total,
            entries: vec![entry],
            sales: vec![sale],
        })
    }

    /// Buy everything in the cart in one unit, then empty it.
    ///
    /// Every line is checked and priced before the first debit. Any failure
    /// leaves wallet, stock and cart exactly as they were.
    pub fn checkout(&self, user: UserId, pin: &str) -> Result<Receipt, EngineError> {
        self.verify_pin(user, pin)?;
        let wallet = self.wallet_of(user)?;

        for attempt in 1..=CHECKOUT_ATTEMPTS {
            let planned = self.store.cart(user);
            if planned.is_empty() {
                return Err(MarketplaceError::EmptyCart(user).into());
            }
            let locks = LockSet::new()
                .cart(user)
                .wallet(wallet)
                .products(planned.items.iter().map(|item| item.product_id));
            let mut uow = self.store.begin(locks, self.now());
            let cart = uow.cart(user).cloned().unwrap_or_else(|| Cart::new(user));
            if cart != planned {
                debug!(user, attempt, "cart changed before checkout locked it");
                continue;
            }

            let mut lines = Vec::with_capacity(cart.items.len());
            let mut total = Points::ZERO;
            for item in &cart.items {
                let product = uow
                    .product(item.product_id)
                    .ok_or(MarketplaceError::ProductNotFound(item.product_id))?;
                check_line(product, item.quantity)?;
                let line_total = product
                    .price
                    .checked_mul(item.quantity)
                    .ok_or(MarketplaceError::TotalOverflow)?;
                total = total
                    .checked_add(line_total)
                    .ok_or(MarketplaceError::TotalOverflow)?;
                lines.push((product.clone(), item.quantity));
            }
            let balance = uow
                .wallet(wallet)
                .ok_or(LedgerError::WalletNotFound(wallet))?
                .balance;
            if balance < total {
                return Err(LedgerError::InsufficientBalance {
                    wallet,
                    balance,
                    requested: total,
                }
                .into());
            }

            let mut entries = Vec::with_capacity(lines.len());
            let mut sales = Vec::with_capacity(lines.len());
            for (product, quantity) in &lines {
                let (entry, sale) = buy_line(&mut uow, wallet, product, *quantity)?;
                entries.push(entry);
                sales.push(sale);
            }
            uow.cart_mut(user)
                .ok_or(EngineError::Conflict("cart"))?
                .items
                .clear();
            uow.commit()?;

            return Ok(Receipt {
                wallet,
                total,
                entries,
                sales,
            });
        }
        Err(EngineError::Conflict("cart"))
    }
}

/// Debit one line, take its stock and record the sale, all in `uow`.
fn buy_line(
    uow: &mut UnitOfWork<'_>,
    wallet: WalletId,
    product: &Product,
    quantity: u32,
) -> Result<(LedgerEntry, SaleRecord), EngineError> {
    let total = product
        .price
        .checked_mul(quantity)
        .ok_or(MarketplaceError::TotalOverflow)?;
    let entry = ledger::debit(
        uow,
        Posting::new(
            wallet,
            total,
            EntryType::Marketplace,
            format!("Purchase: {quantity}x {}", product.name),
        )
        .reference(Some(product.id)),
    )?;
    take_stock(uow, product.id, quantity)?;
    let sale = uow.record_sale(wallet, product.id, product.price, quantity, total);
    Ok((entry, sale))
}

/// Decrement stock of a locked product, refusing to go below zero.
pub(super) fn take_stock(
    uow: &mut UnitOfWork<'_>,
    id: ProductId,
    quantity: u32,
) -> Result<(), MarketplaceError> {
    let product = uow
        .product_mut(id)
        .ok_or(MarketplaceError::ProductNotFound(id))?;
    product.stock = product
        .stock
        .checked_sub(quantity)
        .ok_or(MarketplaceError::OutOfStock {
            product: id,
            available: product.stock,
            requested: quantity,
        })?;
    Ok(())
}

fn check_line(product: &Product, quantity: u32) -> Result<(), MarketplaceError> {
    if !product.is_active() {
        return Err(MarketplaceError::ProductInactive(product.id));
    }
    if product.stock < quantity {
        return Err(MarketplaceError::OutOfStock {
            product: product.id,
            available: product.stock,
            requested: quantity,
        });
    }
    Ok(())
}

fn validate_quantity(quantity: i64) -> Result<u32, MarketplaceError> {
    u32::try_from(quantity)
        .ok()
        .filter(|q| *q > 0)
        .ok_or(MarketplaceError::InvalidQuantity(quantity))
}

fn validate_name(name: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Validation("product name is required"));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::super::testkit::{PIN, TestBed};
    use super::*;
    use crate::model::Direction;

    #[test]
    fn purchase_debits_takes_stock_and_records_sale() {
        let bed = TestBed::new();
        let wallet = bed.student(2, 500);
        let product = bed.product(120, 4);

        let receipt = bed.engine.purchase(2, product, 3, PIN).unwrap();
        assert_eq!(receipt.total, Points::new(360));
        assert_eq!(receipt.entries[0].kind, EntryType::Marketplace);
        assert_eq!(receipt.entries[0].direction, Direction::Debit);
        assert_eq!(receipt.entries[0].reference_id, Some(product));
        assert_eq!(receipt.sales[0].quantity, 3);

        assert_eq!(bed.balance(wallet), 140);
        assert_eq!(bed.stock(product), 1);
        assert_eq!(bed.engine.store().sales().len(), 1);
    }

    #[test]
    fn purchase_beyond_stock_fails_before_any_debit() {
        let bed = TestBed::new();
        let wallet = bed.student(2, 1_000);
        let product = bed.product(10, 2);

        let err = bed.engine.purchase(2, product, 3, PIN).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Marketplace(MarketplaceError::OutOfStock {
                available: 2,
                requested: 3,
                ..
            })
        ));
        assert_eq!(bed.balance(wallet), 1_000);
        assert_eq!(bed.entries(wallet), 1);
        assert_eq!(bed.stock(product), 2);
    }

    #[test]
    fn purchase_quantity_must_be_positive() {
        let bed = TestBed::new();
        bed.student(2, 100);
        let product = bed.product(10, 2);
        assert!(matches!(
            bed.engine.purchase(2, product, 0, PIN),
            Err(EngineError::Marketplace(MarketplaceError::InvalidQuantity(0)))
        ));
    }

    #[test]
    fn inactive_product_cannot_be_bought() {
        let bed = TestBed::new();
        let admin = bed.admin();
        let wallet = bed.student(2, 100);
        let product = bed.product(10, 2);
        bed.engine.deactivate_product(admin, product).unwrap();

        let err = bed.engine.purchase(2, product, 1, PIN).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Marketplace(MarketplaceError::ProductInactive(_))
        ));
        assert_eq!(bed.balance(wallet), 100);
    }

    #[test]
    fn purchase_without_funds_keeps_stock() {
        let bed = TestBed::new();
        let wallet = bed.student(2, 10);
        let product = bed.product(50, 2);
        let err = bed.engine.purchase(2, product, 1, PIN).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::InsufficientBalance { .. })
        ));
        assert_eq!(bed.stock(product), 2);
        assert_eq!(bed.balance(wallet), 10);
        assert!(bed.engine.store().sales().is_empty());
    }

    #[test]
    fn cart_add_increments_and_respects_stock() {
        let bed = TestBed::new();
        bed.student(2, 0);
        let product = bed.product(10, 5);

        bed.engine.add_to_cart(2, product, 2).unwrap();
        let cart = bed.engine.add_to_cart(2, product, 3).unwrap();
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].quantity, 5);

        let err = bed.engine.add_to_cart(2, product, 1).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Marketplace(MarketplaceError::OutOfStock { .. })
        ));
        assert!(matches!(
            bed.engine.add_to_cart(2, 99, 1),
            Err(EngineError::Marketplace(MarketplaceError::ProductNotFound(99)))
        ));
    }

    #[test]
    fn cart_update_and_remove() {
        let bed = TestBed::new();
        bed.student(2, 0);
        let a = bed.product(10, 5);
        let b = bed.product(20, 5);
        bed.engine.add_to_cart(2, a, 1).unwrap();
        bed.engine.add_to_cart(2, b, 1).unwrap();

        let cart = bed.engine.update_cart_item(2, a, 4).unwrap();
        assert_eq!(cart.items[0].quantity, 4);
        let cart = bed.engine.update_cart_item(2, a, 0).unwrap();
        assert_eq!(cart.items.len(), 1);
        let cart = bed.engine.remove_from_cart(2, b).unwrap();
        assert!(cart.is_empty());
        assert!(matches!(
            bed.engine.remove_from_cart(2, b),
            Err(EngineError::Marketplace(MarketplaceError::NotInCart { .. }))
        ));
    }

    #[test]
    fn cart_view_prices_lines() {
        let bed = TestBed::new();
        bed.student(2, 0);
        let a = bed.product(100, 5);
        let b = bed.product(50, 5);
        bed.engine.add_to_cart(2, a, 2).unwrap();
        bed.engine.add_to_cart(2, b, 1).unwrap();

        let view = bed.engine.cart(2);
        assert_eq!(view.lines.len(), 2);
        assert_eq!(view.lines[0].line_total, Points::new(200));
        assert_eq!(view.total, Points::new(250));
    }

    #[test]
    fn checkout_over_budget_changes_nothing() {
        let bed = TestBed::new();
        let wallet = bed.student(2, 200);
        let a = bed.product(100, 5);
        let b = bed.product(50, 5);
        bed.engine.add_to_cart(2, a, 2).unwrap();
        bed.engine.add_to_cart(2, b, 1).unwrap();

        let err = bed.engine.checkout(2, PIN).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::InsufficientBalance { requested, .. })
                if requested == Points::new(250)
        ));
        assert_eq!(bed.balance(wallet), 200);
        assert_eq!(bed.engine.store().cart(2).items.len(), 2);
        assert_eq!(bed.stock(a), 5);
        assert_eq!(bed.stock(b), 5);
        assert_eq!(bed.entries(wallet), 1);
    }

    #[test]
    fn checkout_buys_every_line_and_clears_cart() {
        let bed = TestBed::new();
        let wallet = bed.student(2, 300);
        let a = bed.product(100, 5);
        let b = bed.product(50, 5);
        bed.engine.add_to_cart(2, a, 2).unwrap();
        bed.engine.add_to_cart(2, b, 1).unwrap();

        let receipt = bed.engine.checkout(2, PIN).unwrap();
        assert_eq!(receipt.total, Points::new(250));
        assert_eq!(receipt.entries.len(), 2);
        assert_eq!(receipt.sales.len(), 2);
        assert_eq!(bed.balance(wallet), 50);
        assert_eq!(bed.stock(a), 3);
        assert_eq!(bed.stock(b), 4);
        assert!(bed.engine.store().cart(2).is_empty());
        assert!(bed.engine.store().reconcile(wallet).unwrap().is_consistent());
    }

    #[test]
    fn checkout_with_one_bad_line_aborts_all_lines() {
        let bed = TestBed::new();
        let admin = bed.admin();
        let wallet = bed.student(2, 1_000);
        let a = bed.product(100, 5);
        let b = bed.product(50, 5);
        bed.engine.add_to_cart(2, a, 1).unwrap();
        bed.engine.add_to_cart(2, b, 2).unwrap();
        bed.engine
            .update_product(
                admin,
                b,
                ProductPatch {
                    stock: Some(1),
                    ..ProductPatch::default()
                },
            )
            .unwrap();

        let err = bed.engine.checkout(2, PIN).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Marketplace(MarketplaceError::OutOfStock { .. })
        ));
        assert_eq!(bed.balance(wallet), 1_000);
        assert_eq!(bed.stock(a), 5);
        assert_eq!(bed.engine.store().cart(2).items.len(), 2);
    }

    #[test]
    fn empty_cart_cannot_check_out() {
        let bed = TestBed::new();
        bed.student(2, 100);
        assert!(matches!(
            bed.engine.checkout(2, PIN),
            Err(EngineError::Marketplace(MarketplaceError::EmptyCart(2)))
        ));
    }

    #[test]
    fn product_management_is_admin_only() {
        let bed = TestBed::new();
        let admin = bed.admin();
        bed.student(2, 0);

        assert!(matches!(
            bed.engine.create_product(2, "Mug", "", 30, 3),
            Err(EngineError::Forbidden { .. })
        ));
        let product = bed.engine.create_product(admin, " Mug ", "ceramic", 30, 3).unwrap();
        assert_eq!(product.name, "Mug");
        assert!(product.is_active());

        let updated = bed
            .engine
            .update_product(
                admin,
                product.id,
                ProductPatch {
                    price: Some(35),
                    ..ProductPatch::default()
                },
            )
            .unwrap();
        assert_eq!(updated.price, Points::new(35));
        assert_eq!(updated.stock, 3);

        assert!(matches!(
            bed.engine.create_product(admin, "Mug", "", 0, 3),
            Err(EngineError::Marketplace(MarketplaceError::InvalidPrice(0)))
        ));
        assert!(matches!(
            bed.engine.create_product(admin, "Mug", "", 10, -1),
            Err(EngineError::Marketplace(MarketplaceError::InvalidStock(-1)))
        ));
    }
}
