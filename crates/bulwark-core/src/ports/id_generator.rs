//! IdGenerator port.
//!
//! Ids are ULIDs whose timestamp part comes from the injected `Clock`, so a
//! `FixedClock` in tests yields ids with a known timestamp.

use ulid::Ulid;

use crate::domain::{BatchId, SessionId};
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn session_id(&self) -> SessionId;

    fn batch_id(&self) -> BatchId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn session_id(&self) -> SessionId {
        SessionId::from(self.next_ulid())
    }

    fn batch_id(&self) -> BatchId {
        BatchId::from(self.next_ulid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generates_unique_ids() {
        let id_gen = UlidGenerator::new(SystemClock);
        let a = id_gen.session_id();
        let b = id_gen.session_id();
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_clock_pins_the_timestamp() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let id_gen = UlidGenerator::new(FixedClock::new(fixed_time));

        let id1 = id_gen.batch_id();
        let id2 = id_gen.batch_id();

        // random part still differs
        assert_ne!(id1, id2);
        assert_eq!(id1.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
        assert_eq!(id2.as_ulid().timestamp_ms(), fixed_time.timestamp_millis() as u64);
    }
}
