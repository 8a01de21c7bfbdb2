use serde::Serialize;
use std::io;

use crate::model::{UserId, WalletId};
use crate::store::Store;

#[derive(Debug, Serialize)]
struct WalletRow {
    wallet: WalletId,
    user: UserId,
    balance: u64,
    entries: usize,
    reconciled: bool,
}

/// Write one csv row per wallet, in wallet id order.
pub fn write_wallets(store: &Store, out: impl io::Write) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(out);

    for wallet in store.wallets() {
        let Some(check) = store.reconcile(wallet.id) else {
            continue;
        };
        writer.serialize(WalletRow {
            wallet: wallet.id,
            user: wallet.user_id,
            balance: check.balance.get(),
            entries: check.entries,
            reconciled: check.is_consistent(),
        })?;
    }

    writer.flush()?;
    Ok(())
}
