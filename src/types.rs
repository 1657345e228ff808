// 1.0: all the primitives live here. nothing in the engine works without these types.
// instrument keys, directions, prices, sizes, leverage, timestamps. each is a newtype
// so the compiler catches type mixups.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordinal position of a tick within one instrument's stream.
pub type Offset = i64;

// 1.1: currency code, always upper case so "btc" and "BTC" are the same key
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CurrencyCode(String);

impl CurrencyCode {
    pub fn new(code: &str) -> Self {
        Self(code.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: CurrencyCode,
    pub quote: CurrencyCode,
}

impl CurrencyPair {
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: CurrencyCode::new(base),
            quote: CurrencyCode::new(quote),
        }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    #[default]
    Spot,
    Futures,
    PerpetualSwap,
}

impl AssetKind {
    pub fn is_futures(&self) -> bool {
        matches!(self, AssetKind::Futures | AssetKind::PerpetualSwap)
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssetKind::Spot => "spot",
            AssetKind::Futures => "futures",
            AssetKind::PerpetualSwap => "perpetualswap",
        };
        f.write_str(s)
    }
}

// 1.2: the composite key. one flat map keyed by this replaces exchange -> asset -> pair nesting.
// Ord so every fan-out walks instruments in the same order run after run.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub exchange: String,
    pub asset: AssetKind,
    pub pair: CurrencyPair,
}

impl InstrumentKey {
    pub fn new(exchange: &str, asset: AssetKind, pair: CurrencyPair) -> Self {
        Self {
            exchange: exchange.trim().to_lowercase(),
            asset,
            pair,
        }
    }

    pub fn spot(exchange: &str, base: &str, quote: &str) -> Self {
        Self::new(exchange, AssetKind::Spot, CurrencyPair::new(base, quote))
    }

    pub fn futures(exchange: &str, base: &str, quote: &str) -> Self {
        Self::new(exchange, AssetKind::Futures, CurrencyPair::new(base, quote))
    }

    pub fn is_futures(&self) -> bool {
        self.asset.is_futures()
    }

    pub fn same_exchange(&self, other: &InstrumentKey) -> bool {
        self.exchange == other.exchange
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.exchange, self.asset, self.pair)
    }
}

// 1.3: what a strategy wants, or why it could not get it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
    Short,
    Long,
    DoNothing,
    CouldNotBuy,
    CouldNotSell,
    MissingData,
    ClosePosition,
}

impl Direction {
    /// Directions the exchange can actually fill.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            Direction::Buy
                | Direction::Sell
                | Direction::Short
                | Direction::Long
                | Direction::ClosePosition
        )
    }

    /// Buy side of the book: spend quote, receive base.
    pub fn is_buy_side(&self) -> bool {
        matches!(self, Direction::Buy | Direction::Long | Direction::CouldNotBuy)
    }

    // downgrade used when funding, sizing or risk refuses the order.
    // futures sides map onto the spot refusals since the set of directions is closed
    pub fn could_not(&self) -> Direction {
        match self {
            Direction::Buy | Direction::Long => Direction::CouldNotBuy,
            Direction::Sell | Direction::Short => Direction::CouldNotSell,
            _ => Direction::DoNothing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
            Direction::Short => "SHORT",
            Direction::Long => "LONG",
            Direction::DoNothing => "DO NOTHING",
            Direction::CouldNotBuy => "COULD NOT BUY",
            Direction::CouldNotSell => "COULD NOT SELL",
            Direction::MissingData => "MISSING DATA",
            Direction::ClosePosition => "CLOSE POSITION",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// 1.4: candle width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval(i64);

impl Interval {
    pub const ONE_MINUTE: Interval = Interval(60_000);
    pub const ONE_HOUR: Interval = Interval(3_600_000);
    pub const ONE_DAY: Interval = Interval(86_400_000);

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.0.max(0) as u64)
    }
}

impl Default for Interval {
    fn default() -> Self {
        Self::ONE_HOUR
    }
}

// 1.5: signed size: positive = long, negative = short. core to all position math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedSize(Decimal);

impl SignedSize {
    pub fn new(size: Decimal) -> Self {
        Self(size)
    }

    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    /// Long and Buy are positive, Short and Sell negative.
    pub fn from_direction(direction: Direction, abs_size: Decimal) -> Self {
        match direction {
            Direction::Short | Direction::Sell => Self(-abs_size.abs()),
            _ => Self(abs_size.abs()),
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn abs(&self) -> Decimal {
        self.0.abs()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_long(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn direction(&self) -> Option<Direction> {
        if self.is_long() {
            Some(Direction::Long)
        } else if self.is_short() {
            Some(Direction::Short)
        } else {
            None
        }
    }
}

impl fmt::Display for SignedSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// 1.6: price in quote currency per unit of base. must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Price(Decimal);

impl Price {
    #[must_use]
    pub fn new(value: Decimal) -> Option<Self> {
        if value > Decimal::ZERO {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn new_unchecked(value: Decimal) -> Self {
        debug_assert!(value > Decimal::ZERO);
        Self(value)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// 1.7: quote currency amount. collateral, pnl, fees all use this.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Quote(Decimal);

impl Quote {
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn add(&self, other: Quote) -> Self {
        Self(self.0 + other.0)
    }

    pub fn sub(&self, other: Quote) -> Self {
        Self(self.0 - other.0)
    }
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::iter::Sum for Quote {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), |acc, q| acc.add(q))
    }
}

// 1.8: leverage multiplier. must be >= 1x.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub struct Leverage(Decimal);

impl Leverage {
    #[must_use]
    pub fn new(value: Decimal) -> Option<Self> {
        if value >= Decimal::ONE {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn one() -> Self {
        Self(Decimal::ONE)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    // 10x leverage → 10% margin fraction (1/10)
    pub fn initial_margin_fraction(&self) -> Decimal {
        Decimal::ONE / self.0
    }
}

impl Default for Leverage {
    fn default() -> Self {
        Self::one()
    }
}

impl fmt::Display for Leverage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x", self.0)
    }
}

// 1.9: millisecond timestamp. zero means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn is_unset(&self) -> bool {
        self.0 == 0
    }

    pub fn add(&self, interval: Interval) -> Self {
        Self(self.0 + interval.as_millis())
    }

    pub fn elapsed_hours(&self, other: &Timestamp) -> Decimal {
        let diff_ms = (other.0 - self.0).abs();
        Decimal::new(diff_ms, 0) / dec!(3_600_000)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            None => write!(f, "{}ms", self.0),
        }
    }
}
