//! Ledger adapter: the token mint/burn primitives the coordinator drives.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rust_decimal::Decimal;

use agentmesh_core::types::Balances;

use crate::error::LedgerError;

#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    async fn get_balances(&self) -> Result<Balances, LedgerError>;
    async fn mint(&self, asset: &str, amount: Decimal) -> Result<(), LedgerError>;
    async fn burn(&self, asset: &str, amount: Decimal) -> Result<(), LedgerError>;
}

/// One call that reached the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    GetBalances,
    Mint { asset: String, amount: Decimal },
    Burn { asset: String, amount: Decimal },
}

#[derive(Debug, Default)]
struct Inner {
    balances: Balances,
    balance_faults: VecDeque<LedgerError>,
    asset_faults: HashMap<String, VecDeque<LedgerError>>,
    calls: Vec<LedgerCall>,
}

/// Balances held in memory. Burning more than an asset's balance is
/// rejected; faults can be queued per asset or for the next balance read.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new(balances: Balances) -> Self {
        Self {
            inner: Mutex::new(Inner {
                balances,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn balances(&self) -> Balances {
        self.lock().balances.clone()
    }

    pub fn calls(&self) -> Vec<LedgerCall> {
        self.lock().calls.clone()
    }

    pub fn fail_next_balances(&self, err: LedgerError) {
        self.lock().balance_faults.push_back(err);
    }

    /// Make the next mint or burn of `asset` fail with `err`.
    pub fn fail_next(&self, asset: &str, err: LedgerError) {
        self.lock()
            .asset_faults
            .entry(asset.to_owned())
            .or_default()
            .push_back(err);
    }

    fn take_fault(inner: &mut Inner, asset: &str) -> Option<LedgerError> {
        inner.asset_faults.get_mut(asset).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl LedgerAdapter for MemoryLedger {
    async fn get_balances(&self) -> Result<Balances, LedgerError> {
        let mut inner = self.lock();
        inner.calls.push(LedgerCall::GetBalances);
        if let Some(err) = inner.balance_faults.pop_front() {
            return Err(err);
        }
        Ok(inner.balances.clone())
    }

    async fn mint(&self, asset: &str, amount: Decimal) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        inner.calls.push(LedgerCall::Mint {
            asset: asset.to_owned(),
            amount,
        });
        if let Some(err) = Self::take_fault(&mut inner, asset) {
            return Err(err);
        }
        if amount <= Decimal::ZERO {
            return Err(LedgerError::Rejected {
                operation: format!("mint {asset}"),
                reason: format!("non-positive amount {amount}"),
            });
        }
        *inner.balances.entry(asset.to_owned()).or_default() += amount;
        Ok(())
    }

    async fn burn(&self, asset: &str, amount: Decimal) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        inner.calls.push(LedgerCall::Burn {
            asset: asset.to_owned(),
            amount,
        });
        if let Some(err) = Self::take_fault(&mut inner, asset) {
            return Err(err);
        }
        let held = inner.balances.get(asset).copied().unwrap_or_default();
        if amount <= Decimal::ZERO || amount > held {
            return Err(LedgerError::Rejected {
                operation: format!("burn {asset}"),
                reason: format!("amount {amount} against balance {held}"),
            });
        }
        inner.balances.insert(asset.to_owned(), held - amount);
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger() -> MemoryLedger {
        MemoryLedger::new(Balances::from([
            ("A".to_owned(), dec!(100)),
            ("B".to_owned(), dec!(50)),
        ]))
    }

    #[tokio::test]
    async fn mint_and_burn_move_balances() {
        let l = ledger();
        l.mint("A", dec!(25)).await.expect("mint");
        l.burn("B", dec!(50)).await.expect("burn");
        l.mint("C", dec!(3)).await.expect("mint new asset");

        let b = l.get_balances().await.expect("balances");
        assert_eq!(b["A"], dec!(125));
        assert_eq!(b["B"], dec!(0));
        assert_eq!(b["C"], dec!(3));
    }

    #[tokio::test]
    async fn overdraw_is_rejected() {
        let l = ledger();
        let err = l.burn("B", dec!(51)).await.expect_err("overdraw");
        assert!(matches!(err, LedgerError::Rejected { .. }));
        assert_eq!(l.balances()["B"], dec!(50));
    }

    #[tokio::test]
    async fn queued_faults_fire_once() {
        let l = ledger();
        l.fail_next("A", LedgerError::Unavailable("down".into()));
        l.fail_next_balances(LedgerError::Unavailable("down".into()));

        assert!(l.mint("A", dec!(1)).await.is_err());
        assert!(l.mint("A", dec!(1)).await.is_ok());
        assert!(l.get_balances().await.is_err());
        assert!(l.get_balances().await.is_ok());
        assert_eq!(l.calls().len(), 4);
    }
}
