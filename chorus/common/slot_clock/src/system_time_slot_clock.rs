use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::SlotClock;

/// A slot clock driven by the system wall clock.
#[derive(Clone, Debug)]
pub struct SystemTimeSlotClock {
    genesis_duration: Duration,
    slot_duration: Duration,
}

impl SystemTimeSlotClock {
    pub fn new(genesis_duration: Duration, slot_duration: Duration) -> Self {
        assert!(!slot_duration.is_zero(), "slot duration must be non-zero");
        Self {
            genesis_duration,
            slot_duration,
        }
    }
}

impl SlotClock for SystemTimeSlotClock {
    fn now(&self) -> Option<u64> {
        let now = self.now_duration()?;
        let since_genesis = now.checked_sub(self.genesis_duration)?;
        Some(since_genesis.as_secs() / self.slot_duration.as_secs().max(1))
    }

    fn now_duration(&self) -> Option<Duration> {
        SystemTime::now().duration_since(UNIX_EPOCH).ok()
    }

    fn slot_duration(&self) -> Duration {
        self.slot_duration
    }

    fn duration_to_next_slot(&self) -> Option<Duration> {
        let now = self.now_duration()?;
        if now < self.genesis_duration {
            return Some(self.genesis_duration - now);
        }
        let since_genesis = now - self.genesis_duration;
        let slot_nanos = self.slot_duration.as_nanos();
        let into_slot = since_genesis.as_nanos() % slot_nanos;
        Some(Duration::from_nanos((slot_nanos - into_slot) as u64))
    }

    fn genesis_duration(&self) -> Duration {
        self.genesis_duration
    }
}
