// 6.2: compliance snapshots. append-only history of filled orders per instrument.
// each snapshot carries every order so far, so the latest one is the full record.

use crate::events::{FillEvent, FilledOrder};
use crate::types::{Offset, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComplianceError {
    #[error("snapshot with unset timestamp received")]
    NoTimestamp,

    #[error("snapshot at offset {received} is older than latest offset {latest}")]
    OutOfOrder { received: Offset, latest: Offset },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotOrder {
    pub close_price: Decimal,
    pub volume_adjusted_price: Decimal,
    pub slippage_rate: Decimal,
    pub cost_basis: Decimal,
    pub order: FilledOrder,
}

impl SnapshotOrder {
    pub fn from_fill(fill: &FillEvent, order: &FilledOrder) -> Self {
        Self {
            close_price: fill.close_price,
            volume_adjusted_price: fill.volume_adjusted_price,
            slippage_rate: fill.slippage,
            cost_basis: order.cost() + order.fee,
            order: order.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplianceSnapshot {
    pub offset: Offset,
    pub timestamp: Timestamp,
    pub orders: Vec<SnapshotOrder>,
}

impl ComplianceSnapshot {
    pub fn cost_basis(&self) -> Decimal {
        self.orders.iter().map(|o| o.cost_basis).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ComplianceManager {
    snapshots: Vec<ComplianceSnapshot>,
}

impl ComplianceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&mut self, snapshot: ComplianceSnapshot) -> Result<(), ComplianceError> {
        if snapshot.timestamp.is_unset() {
            return Err(ComplianceError::NoTimestamp);
        }
        if let Some(latest) = self.snapshots.last() {
            if snapshot.offset < latest.offset {
                return Err(ComplianceError::OutOfOrder {
                    received: snapshot.offset,
                    latest: latest.offset,
                });
            }
        }
        self.snapshots.push(snapshot);
        Ok(())
    }

    /// Build the next snapshot from the previous one plus this fill's order, if it has one.
    pub fn snapshot_for_fill(&self, fill: &FillEvent) -> ComplianceSnapshot {
        let mut orders = self
            .latest_snapshot()
            .map(|s| s.orders.clone())
            .unwrap_or_default();
        if let Some(order) = &fill.order {
            orders.push(SnapshotOrder::from_fill(fill, order));
        }
        ComplianceSnapshot {
            offset: fill.meta.offset,
            timestamp: fill.meta.time,
            orders,
        }
    }

    pub fn latest_snapshot(&self) -> Option<&ComplianceSnapshot> {
        self.snapshots.last()
    }

    pub fn snapshot_at_offset(&self, offset: Offset) -> Option<&ComplianceSnapshot> {
        self.snapshots.iter().rev().find(|s| s.offset == offset)
    }

    pub fn snapshots(&self) -> &[ComplianceSnapshot] {
        &self.snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, Leverage};
    use rust_decimal_macros::dec;

    fn snap(offset: Offset, ms: i64) -> ComplianceSnapshot {
        ComplianceSnapshot {
            offset,
            timestamp: Timestamp::from_millis(ms),
            orders: Vec::new(),
        }
    }

    #[test]
    fn append_only() {
        let mut cm = ComplianceManager::new();
        cm.add_snapshot(snap(1, 10)).unwrap();
        cm.add_snapshot(snap(1, 10)).unwrap();
        cm.add_snapshot(snap(2, 20)).unwrap();
        assert_eq!(cm.snapshots().len(), 3);
        assert!(matches!(cm.add_snapshot(snap(0, 5)), Err(ComplianceError::OutOfOrder { .. })));
        assert_eq!(cm.add_snapshot(snap(3, 0)), Err(ComplianceError::NoTimestamp));
        assert_eq!(cm.snapshots().len(), 3);
    }

    #[test]
    fn cost_basis_sums_orders() {
        let order = FilledOrder {
            id: 1,
            direction: Direction::Buy,
            price: dec!(100),
            amount: dec!(2),
            fee: dec!(1),
            leverage: Leverage::one(),
            date: Timestamp::from_millis(1),
        };
        let mut s = snap(1, 1);
        s.orders.push(SnapshotOrder {
            close_price: dec!(100),
            volume_adjusted_price: dec!(100),
            slippage_rate: dec!(0),
            cost_basis: order.cost() + order.fee,
            order,
        });
        assert_eq!(s.cost_basis(), dec!(201));
    }
}
