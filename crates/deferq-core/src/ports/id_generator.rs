//! LeaseIdGenerator port - リース ID 生成の抽象化
//!
//! # 実装
//! - **UlidLeaseIds**: ULID ベース。Clock を受け取るので FixedClock で timestamp 部分を固定できる

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::LeaseId;
use crate::ports::Clock;

pub trait LeaseIdGenerator: Send + Sync {
    fn next_lease_id(&self) -> LeaseId;
}

pub struct UlidLeaseIds {
    clock: Arc<dyn Clock>,
}

impl UlidLeaseIds {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl LeaseIdGenerator for UlidLeaseIds {
    fn next_lease_id(&self) -> LeaseId {
        let timestamp_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        LeaseId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn lease_ids_are_unique() {
        let ids = UlidLeaseIds::new(Arc::new(SystemClock));
        let a = ids.next_lease_id();
        let b = ids.next_lease_id();
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_clock_pins_timestamp_part() {
        let fixed = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ids = UlidLeaseIds::new(Arc::new(FixedClock::new(fixed)));

        let a = ids.next_lease_id();
        let b = ids.next_lease_id();

        // ランダム部分があるので ID は異なるが timestamp は同じ
        assert_ne!(a, b);
        assert_eq!(a.as_ulid().timestamp_ms(), fixed.timestamp_millis() as u64);
        assert_eq!(b.as_ulid().timestamp_ms(), fixed.timestamp_millis() as u64);
    }
}
