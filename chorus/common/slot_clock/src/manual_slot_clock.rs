use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::SlotClock;

/// A slot clock whose time is set explicitly. Test use only.
#[derive(Clone)]
pub struct ManualSlotClock {
    genesis_duration: Duration,
    slot_duration: Duration,
    current: Arc<RwLock<Duration>>,
}

impl ManualSlotClock {
    pub fn new(genesis_duration: Duration, slot_duration: Duration) -> Self {
        Self {
            genesis_duration,
            slot_duration,
            current: Arc::new(RwLock::new(genesis_duration)),
        }
    }

    pub fn set_slot(&self, slot: u64) {
        *self.current.write() = self.genesis_duration + self.slot_duration * (slot as u32);
    }

    pub fn advance_slot(&self) {
        *self.current.write() += self.slot_duration;
    }
}

impl SlotClock for ManualSlotClock {
    fn now(&self) -> Option<u64> {
        let now = *self.current.read();
        let since_genesis = now.checked_sub(self.genesis_duration)?;
        Some(since_genesis.as_secs() / self.slot_duration.as_secs().max(1))
    }

    fn now_duration(&self) -> Option<Duration> {
        Some(*self.current.read())
    }

    fn slot_duration(&self) -> Duration {
        self.slot_duration
    }

    fn duration_to_next_slot(&self) -> Option<Duration> {
        let now = *self.current.read();
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
