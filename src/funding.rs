//! Funding ledger and reservation tokens.
//!
//! Every instrument gets a funding pool. Spot instruments hold a base and a
//! quote item; futures instruments hold an open contract item and the
//! collateral backing it. Stages never touch the pools directly: they borrow
//! a reader, reserver, releaser or collateral token scoped to the operation.

use crate::types::{CurrencyCode, Direction, InstrumentKey, SignedSize, Timestamp};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FundingError {
    #[error("no funding found for {0}")]
    NotFound(InstrumentKey),

    #[error("amount must be greater than zero, received {0}")]
    ZeroAmount(Decimal),

    #[error("cannot allocate {requested} {currency}: {available} available")]
    CannotAllocate {
        currency: CurrencyCode,
        requested: Decimal,
        available: Decimal,
    },

    #[error("cannot release {requested} {currency}: {reserved} reserved")]
    CannotRelease {
        currency: CurrencyCode,
        requested: Decimal,
        reserved: Decimal,
    },

    #[error("funding for {0} is not collateral backed")]
    NotCollateral(InstrumentKey),

    #[error("collateral {currency} not found for {instrument}")]
    CollateralNotFound {
        instrument: InstrumentKey,
        currency: CurrencyCode,
    },

    #[error("direction {0} cannot use this funding")]
    InvalidDirection(Direction),
}

// 5.0: one currency balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingItem {
    pub currency: CurrencyCode,
    pub initial: Decimal,
    pub available: Decimal,
    pub reserved: Decimal,
}

impl FundingItem {
    pub fn new(currency: CurrencyCode, initial: Decimal) -> Self {
        Self {
            currency,
            initial,
            available: initial,
            reserved: Decimal::ZERO,
        }
    }

    pub fn reserve(&mut self, amount: Decimal) -> Result<(), FundingError> {
        if amount <= Decimal::ZERO {
            return Err(FundingError::ZeroAmount(amount));
        }
        if amount > self.available {
            return Err(FundingError::CannotAllocate {
                currency: self.currency.clone(),
                requested: amount,
                available: self.available,
            });
        }
        self.available -= amount;
        self.reserved += amount;
        Ok(())
    }

    // drops `amount` from reserved and hands `diff` (the unspent part) back to available
    pub fn release(&mut self, amount: Decimal, diff: Decimal) -> Result<(), FundingError> {
        if amount <= Decimal::ZERO {
            return Err(FundingError::ZeroAmount(amount));
        }
        if amount > self.reserved {
            return Err(FundingError::CannotRelease {
                currency: self.currency.clone(),
                requested: amount,
                reserved: self.reserved,
            });
        }
        self.reserved -= amount;
        self.available += diff.max(Decimal::ZERO);
        Ok(())
    }

    pub fn increase_available(&mut self, amount: Decimal) {
        if amount > Decimal::ZERO {
            self.available += amount;
        }
    }

    pub fn total(&self) -> Decimal {
        self.available + self.reserved
    }

    pub fn reset(&mut self) {
        self.available = self.initial;
        self.reserved = Decimal::ZERO;
    }
}

// 5.1: the token traits. stages get exactly the capability they need

pub trait FundReader {
    fn base_initial_funds(&self) -> Decimal;
    fn quote_initial_funds(&self) -> Decimal;
    fn base_available(&self) -> Decimal;
    fn quote_available(&self) -> Decimal;
    fn can_place_order(&self, direction: Direction) -> bool;
    fn is_collateral(&self) -> bool;

    /// Funds the sizer may spend for `direction`.
    fn available_for(&self, direction: Direction) -> Decimal {
        match direction {
            Direction::Sell => self.base_available(),
            _ => self.quote_available(),
        }
    }
}

pub trait FundReserver: FundReader {
    fn reserve(&mut self, amount: Decimal, direction: Direction) -> Result<(), FundingError>;
}

pub trait FundReleaser: FundReader {
    fn release(&mut self, amount: Decimal, diff: Decimal, direction: Direction) -> Result<(), FundingError>;
    fn increase_available(&mut self, amount: Decimal, direction: Direction);
    fn collateral_releaser(&mut self) -> Option<&mut dyn CollateralReleaser>;
}

pub trait CollateralReader {
    fn collateral_currency(&self) -> &CurrencyCode;
    fn available_collateral(&self) -> Decimal;
    fn reserved_collateral(&self) -> Decimal;
    fn exposure(&self) -> SignedSize;
}

pub trait CollateralReleaser: CollateralReader {
    /// Move open contracts after a fill. ClosePosition shrinks toward flat.
    fn update_contracts(&mut self, direction: Direction, amount: Decimal) -> Result<(), FundingError>;
    /// Hand reserved margin back once contracts close.
    fn release_margin(&mut self, amount: Decimal);
    fn liquidate(&mut self);
}

// 5.2: spot pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotPair {
    pub base: FundingItem,
    pub quote: FundingItem,
}

impl FundReader for SpotPair {
    fn base_initial_funds(&self) -> Decimal {
        self.base.initial
    }

    fn quote_initial_funds(&self) -> Decimal {
        self.quote.initial
    }

    fn base_available(&self) -> Decimal {
        self.base.available
    }

    fn quote_available(&self) -> Decimal {
        self.quote.available
    }

    fn can_place_order(&self, direction: Direction) -> bool {
        match direction {
            Direction::Buy => self.quote.available > Decimal::ZERO,
            Direction::Sell => self.base.available > Decimal::ZERO,
            _ => false,
        }
    }

    fn is_collateral(&self) -> bool {
        false
    }
}

impl FundReserver for SpotPair {
    fn reserve(&mut self, amount: Decimal, direction: Direction) -> Result<(), FundingError> {
        match direction {
            Direction::Buy => self.quote.reserve(amount),
            Direction::Sell => self.base.reserve(amount),
            other => Err(FundingError::InvalidDirection(other)),
        }
    }
}

impl FundReleaser for SpotPair {
    fn release(&mut self, amount: Decimal, diff: Decimal, direction: Direction) -> Result<(), FundingError> {
        match direction {
            Direction::Buy => self.quote.release(amount, diff),
            Direction::Sell => self.base.release(amount, diff),
            other => Err(FundingError::InvalidDirection(other)),
        }
    }

    // buying grows base, selling grows quote
    fn increase_available(&mut self, amount: Decimal, direction: Direction) {
        match direction {
            Direction::Buy => self.base.increase_available(amount),
            Direction::Sell => self.quote.increase_available(amount),
            _ => {}
        }
    }

    fn collateral_releaser(&mut self) -> Option<&mut dyn CollateralReleaser> {
        None
    }
}

// 5.3: futures pool. contract tracks open exposure, collateral backs it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollateralPair {
    pub contract: FundingItem,
    pub collateral: FundingItem,
    pub exposure: SignedSize,
    /// collateral value at the last revaluation
    pub value: Decimal,
}

impl CollateralPair {
    fn revalue(&mut self) {
        self.value = self.collateral.total();
    }
}

impl FundReader for CollateralPair {
    fn base_initial_funds(&self) -> Decimal {
        self.contract.initial
    }

    fn quote_initial_funds(&self) -> Decimal {
        self.collateral.initial
    }

    fn base_available(&self) -> Decimal {
        self.exposure.abs()
    }

    fn quote_available(&self) -> Decimal {
        self.collateral.available
    }

    fn can_place_order(&self, direction: Direction) -> bool {
        match direction {
            Direction::Long | Direction::Short => self.collateral.available > Decimal::ZERO,
            Direction::ClosePosition => !self.exposure.is_zero(),
            _ => false,
        }
    }

    fn is_collateral(&self) -> bool {
        true
    }

    fn available_for(&self, _direction: Direction) -> Decimal {
        self.collateral.available
    }
}

impl FundReserver for CollateralPair {
    fn reserve(&mut self, amount: Decimal, direction: Direction) -> Result<(), FundingError> {
        match direction {
            Direction::Long | Direction::Short => self.collateral.reserve(amount),
            other => Err(FundingError::InvalidDirection(other)),
        }
    }
}

impl FundReleaser for CollateralPair {
    fn release(&mut self, amount: Decimal, diff: Decimal, direction: Direction) -> Result<(), FundingError> {
        match direction {
            Direction::Long | Direction::Short | Direction::ClosePosition => {
                self.collateral.release(amount, diff)
            }
            other => Err(FundingError::InvalidDirection(other)),
        }
    }

    fn increase_available(&mut self, amount: Decimal, _direction: Direction) {
        self.collateral.increase_available(amount);
    }

    fn collateral_releaser(&mut self) -> Option<&mut dyn CollateralReleaser> {
        Some(self as &mut dyn CollateralReleaser)
    }
}

impl CollateralReader for CollateralPair {
    fn collateral_currency(&self) -> &CurrencyCode {
        &self.collateral.currency
    }

    fn available_collateral(&self) -> Decimal {
        self.collateral.available
    }

    fn reserved_collateral(&self) -> Decimal {
        self.collateral.reserved
    }

    fn exposure(&self) -> SignedSize {
        self.exposure
    }
}

impl CollateralReleaser for CollateralPair {
    fn update_contracts(&mut self, direction: Direction, amount: Decimal) -> Result<(), FundingError> {
        if amount <= Decimal::ZERO {
            return Err(FundingError::ZeroAmount(amount));
        }
        self.exposure = match direction {
            Direction::Long => SignedSize::new(self.exposure.value() + amount),
            Direction::Short => SignedSize::new(self.exposure.value() - amount),
            Direction::ClosePosition => {
                let remaining = (self.exposure.abs() - amount).max(Decimal::ZERO);
                SignedSize::new(self.exposure.value().signum() * remaining)
            }
            other => return Err(FundingError::InvalidDirection(other)),
        };
        self.contract.available = self.exposure.abs();
        Ok(())
    }

    fn release_margin(&mut self, amount: Decimal) {
        let amount = amount.min(self.collateral.reserved);
        if amount > Decimal::ZERO {
            self.collateral.reserved -= amount;
            self.collateral.available += amount;
        }
    }

    fn liquidate(&mut self) {
        self.collateral.available = Decimal::ZERO;
        self.collateral.reserved = Decimal::ZERO;
        self.contract.available = Decimal::ZERO;
        self.contract.reserved = Decimal::ZERO;
        self.exposure = SignedSize::zero();
        self.value = Decimal::ZERO;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FundingPool {
    Spot(SpotPair),
    Futures(CollateralPair),
}

impl FundingPool {
    fn reader(&self) -> &dyn FundReader {
        match self {
            FundingPool::Spot(p) => p as &dyn FundReader,
            FundingPool::Futures(p) => p as &dyn FundReader,
        }
    }

    fn items(&self) -> [&FundingItem; 2] {
        match self {
            FundingPool::Spot(p) => [&p.base, &p.quote],
            FundingPool::Futures(p) => [&p.contract, &p.collateral],
        }
    }

    fn reset(&mut self) {
        match self {
            FundingPool::Spot(p) => {
                p.base.reset();
                p.quote.reset();
            }
            FundingPool::Futures(p) => {
                p.contract.reset();
                p.collateral.reset();
                p.exposure = SignedSize::zero();
                p.value = p.collateral.initial;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub instrument: InstrumentKey,
    pub currency: CurrencyCode,
    pub initial: Decimal,
    pub available: Decimal,
    pub reserved: Decimal,
}

/// Audit record of every funding item at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingSnapshot {
    pub time: Timestamp,
    pub items: Vec<ItemSnapshot>,
}

// 5.4: the collaborator seam. the engine only ever talks to funding through this
pub trait FundingManager: Send {
    fn funding_for_event(&self, key: &InstrumentKey) -> Result<&dyn FundReader, FundingError>;
    fn reserver(&mut self, key: &InstrumentKey) -> Result<&mut dyn FundReserver, FundingError>;
    fn releaser(&mut self, key: &InstrumentKey) -> Result<&mut dyn FundReleaser, FundingError>;
    fn collateral_reader(&self, key: &InstrumentKey) -> Result<&dyn CollateralReader, FundingError>;
    fn collateral_releaser(&mut self, key: &InstrumentKey) -> Result<&mut dyn CollateralReleaser, FundingError>;
    fn has_futures(&self) -> bool;
    fn update_collateral_for_event(&mut self, key: &InstrumentKey, is_liquidating: bool) -> Result<(), FundingError>;
    fn create_snapshot(&mut self, time: Timestamp);
    fn realise_pnl(&mut self, key: &InstrumentKey, currency: &CurrencyCode, amount: Decimal) -> Result<(), FundingError>;
    fn liquidate(&mut self, key: &InstrumentKey) -> Result<(), FundingError>;
    fn snapshots(&self) -> &[FundingSnapshot];
    fn reset(&mut self);
}

/// In-memory funding ledger, one pool per instrument.
#[derive(Debug, Default)]
pub struct FundManager {
    pools: BTreeMap<InstrumentKey, FundingPool>,
    snapshots: Vec<FundingSnapshot>,
}

impl FundManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_spot(&mut self, key: InstrumentKey, base_funds: Decimal, quote_funds: Decimal) {
        let pool = FundingPool::Spot(SpotPair {
            base: FundingItem::new(key.pair.base.clone(), base_funds),
            quote: FundingItem::new(key.pair.quote.clone(), quote_funds),
        });
        self.pools.insert(key, pool);
    }

    pub fn add_futures(&mut self, key: InstrumentKey, collateral_currency: CurrencyCode, collateral: Decimal) {
        let pool = FundingPool::Futures(CollateralPair {
            contract: FundingItem::new(key.pair.base.clone(), Decimal::ZERO),
            collateral: FundingItem::new(collateral_currency, collateral),
            exposure: SignedSize::zero(),
            value: collateral,
        });
        self.pools.insert(key, pool);
    }

    pub fn pool(&self, key: &InstrumentKey) -> Result<&FundingPool, FundingError> {
        self.pools.get(key).ok_or_else(|| FundingError::NotFound(key.clone()))
    }

    fn pool_mut(&mut self, key: &InstrumentKey) -> Result<&mut FundingPool, FundingError> {
        self.pools.get_mut(key).ok_or_else(|| FundingError::NotFound(key.clone()))
    }

    fn futures_mut(&mut self, key: &InstrumentKey) -> Result<&mut CollateralPair, FundingError> {
        match self.pool_mut(key)? {
            FundingPool::Futures(pair) => Ok(pair),
            FundingPool::Spot(_) => Err(FundingError::NotCollateral(key.clone())),
        }
    }
}

impl FundingManager for FundManager {
    fn funding_for_event(&self, key: &InstrumentKey) -> Result<&dyn FundReader, FundingError> {
        Ok(self.pool(key)?.reader())
    }

    fn reserver(&mut self, key: &InstrumentKey) -> Result<&mut dyn FundReserver, FundingError> {
        let reserver: &mut dyn FundReserver = match self.pool_mut(key)? {
            FundingPool::Spot(p) => p,
            FundingPool::Futures(p) => p,
        };
        Ok(reserver)
    }

    fn releaser(&mut self, key: &InstrumentKey) -> Result<&mut dyn FundReleaser, FundingError> {
        let releaser: &mut dyn FundReleaser = match self.pool_mut(key)? {
            FundingPool::Spot(p) => p,
            FundingPool::Futures(p) => p,
        };
        Ok(releaser)
    }

    fn collateral_reader(&self, key: &InstrumentKey) -> Result<&dyn CollateralReader, FundingError> {
        match self.pool(key)? {
            FundingPool::Futures(p) => Ok(p as &dyn CollateralReader),
            FundingPool::Spot(_) => Err(FundingError::NotCollateral(key.clone())),
        }
    }

    fn collateral_releaser(&mut self, key: &InstrumentKey) -> Result<&mut dyn CollateralReleaser, FundingError> {
        let releaser: &mut dyn CollateralReleaser = self.futures_mut(key)?;
        Ok(releaser)
    }

    fn has_futures(&self) -> bool {
        self.pools.keys().any(InstrumentKey::is_futures)
    }

    fn update_collateral_for_event(&mut self, key: &InstrumentKey, is_liquidating: bool) -> Result<(), FundingError> {
        if !self.pools.contains_key(key) {
            return Err(FundingError::NotFound(key.clone()));
        }
        for (k, pool) in self.pools.iter_mut() {
            if !k.same_exchange(key) {
                continue;
            }
            if let FundingPool::Futures(pair) = pool {
                if is_liquidating {
                    pair.liquidate();
                } else {
                    pair.revalue();
                }
            }
        }
        Ok(())
    }

    // one snapshot per time; a second call at the same time replaces it
    fn create_snapshot(&mut self, time: Timestamp) {
        let items = self
            .pools
            .iter()
            .flat_map(|(key, pool)| {
                pool.items().into_iter().map(move |item| ItemSnapshot {
                    instrument: key.clone(),
                    currency: item.currency.clone(),
                    initial: item.initial,
                    available: item.available,
                    reserved: item.reserved,
                })
            })
            .collect();
        let snapshot = FundingSnapshot { time, items };
        match self.snapshots.iter_mut().find(|s| s.time == time) {
            Some(existing) => *existing = snapshot,
            None => self.snapshots.push(snapshot),
        }
    }

    fn realise_pnl(&mut self, key: &InstrumentKey, currency: &CurrencyCode, amount: Decimal) -> Result<(), FundingError> {
        let pair = self.futures_mut(key)?;
        if &pair.collateral.currency != currency {
            return Err(FundingError::CollateralNotFound {
                instrument: key.clone(),
                currency: currency.clone(),
            });
        }
        pair.collateral.available += amount;
        pair.revalue();
        Ok(())
    }

    fn liquidate(&mut self, key: &InstrumentKey) -> Result<(), FundingError> {
        match self.pool_mut(key)? {
            FundingPool::Futures(pair) => pair.liquidate(),
            FundingPool::Spot(pair) => {
                pair.base.available = Decimal::ZERO;
                pair.base.reserved = Decimal::ZERO;
                pair.quote.available = Decimal::ZERO;
                pair.quote.reserved = Decimal::ZERO;
            }
        }
        Ok(())
    }

    fn snapshots(&self) -> &[FundingSnapshot] {
        &self.snapshots
    }

    fn reset(&mut self) {
        for pool in self.pools.values_mut() {
            pool.reset();
        }
        self.snapshots.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn spot_key() -> InstrumentKey {
        InstrumentKey::spot("binance", "BTC", "USDT")
    }

    fn futures_key() -> InstrumentKey {
        InstrumentKey::futures("binance", "BTC", "USDT")
    }

    fn manager() -> FundManager {
        let mut m = FundManager::new();
        m.add_spot(spot_key(), dec!(1), dec!(10000));
        m.add_futures(futures_key(), CurrencyCode::new("USDT"), dec!(5000));
        m
    }

    #[test]
    fn reserve_and_release_round_trip() {
        let mut item = FundingItem::new(CurrencyCode::new("USD"), dec!(100));
        item.reserve(dec!(40)).unwrap();
        assert_eq!(item.available, dec!(60));
        assert_eq!(item.reserved, dec!(40));

        // spent 30 of the 40, 10 goes back
        item.release(dec!(40), dec!(10)).unwrap();
        assert_eq!(item.available, dec!(70));
        assert_eq!(item.reserved, dec!(0));
    }

    #[test]
    fn reserve_rejects_bad_amounts() {
        let mut item = FundingItem::new(CurrencyCode::new("USD"), dec!(100));
        assert!(matches!(item.reserve(dec!(0)), Err(FundingError::ZeroAmount(_))));
        assert!(matches!(item.reserve(dec!(101)), Err(FundingError::CannotAllocate { .. })));
        assert!(matches!(item.release(dec!(1), dec!(1)), Err(FundingError::CannotRelease { .. })));
        assert_eq!(item.available, dec!(100));
    }

    #[test]
    fn spot_sides_hit_the_right_currency() {
        let mut m = manager();
        let r = m.reserver(&spot_key()).unwrap();
        r.reserve(dec!(0.5), Direction::Sell).unwrap();
        r.reserve(dec!(1000), Direction::Buy).unwrap();
        assert_eq!(r.base_available(), dec!(0.5));
        assert_eq!(r.quote_available(), dec!(9000));
        assert!(matches!(
            r.reserve(dec!(1), Direction::Long),
            Err(FundingError::InvalidDirection(Direction::Long))
        ));
    }

    #[test]
    fn can_place_order_per_side() {
        let mut m = FundManager::new();
        m.add_spot(spot_key(), dec!(0), dec!(100));
        let reader = m.funding_for_event(&spot_key()).unwrap();
        assert!(reader.can_place_order(Direction::Buy));
        assert!(!reader.can_place_order(Direction::Sell));
        assert!(!reader.can_place_order(Direction::DoNothing));
    }

    #[test]
    fn collateral_tracks_contracts() {
        let mut m = manager();
        let c = m.collateral_releaser(&futures_key()).unwrap();
        c.update_contracts(Direction::Short, dec!(2)).unwrap();
        assert_eq!(c.exposure().value(), dec!(-2));
        c.update_contracts(Direction::ClosePosition, dec!(1.5)).unwrap();
        assert_eq!(c.exposure().value(), dec!(-0.5));
        c.update_contracts(Direction::ClosePosition, dec!(5)).unwrap();
        assert!(c.exposure().is_zero());
    }

    #[test]
    fn spot_has_no_collateral() {
        let mut m = manager();
        assert!(matches!(
            m.collateral_releaser(&spot_key()),
            Err(FundingError::NotCollateral(_))
        ));
        assert!(m.releaser(&spot_key()).unwrap().collateral_releaser().is_none());
        assert!(m.has_futures());
    }

    #[test]
    fn realise_pnl_checks_currency() {
        let mut m = manager();
        m.realise_pnl(&futures_key(), &CurrencyCode::new("USDT"), dec!(250)).unwrap();
        assert_eq!(m.collateral_reader(&futures_key()).unwrap().available_collateral(), dec!(5250));

        let err = m.realise_pnl(&futures_key(), &CurrencyCode::new("BTC"), dec!(1)).unwrap_err();
        assert!(matches!(err, FundingError::CollateralNotFound { .. }));
    }

    #[test]
    fn liquidate_zeroes_collateral() {
        let mut m = manager();
        m.reserver(&futures_key()).unwrap().reserve(dec!(1000), Direction::Long).unwrap();
        m.liquidate(&futures_key()).unwrap();
        let reader = m.collateral_reader(&futures_key()).unwrap();
        assert_eq!(reader.available_collateral(), dec!(0));
        assert_eq!(reader.reserved_collateral(), dec!(0));
    }

    #[test]
    fn snapshots_replace_same_time() {
        let mut m = manager();
        m.create_snapshot(Timestamp::from_millis(1));
        m.reserver(&spot_key()).unwrap().reserve(dec!(100), Direction::Buy).unwrap();
        m.create_snapshot(Timestamp::from_millis(1));
        m.create_snapshot(Timestamp::from_millis(2));
        assert_eq!(m.snapshots().len(), 2);
        let quote = m.snapshots()[0]
            .items
            .iter()
            .find(|i| i.currency == CurrencyCode::new("USDT") && !i.instrument.is_futures())
            .unwrap();
        assert_eq!(quote.reserved, dec!(100));

        m.reset();
        assert!(m.snapshots().is_empty());
        assert_eq!(m.funding_for_event(&spot_key()).unwrap().quote_available(), dec!(10000));
    }
}
