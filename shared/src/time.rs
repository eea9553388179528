use std::time::{Duration, Instant};

/// Nanoseconds on a monotonic clock, relative to an arbitrary epoch.
///
/// `SentPacket`/`RecvPacket` timestamps are stored this way rather than as
/// `Instant` so that they remain `Copy`, comparable, and cheap to store in
/// ring buffers by the million; callers derive them from an `Instant` anchor
/// chosen once at session start.
pub type MonoNanos = i64;

/// A fixed point in time used to convert between `Instant` and `MonoNanos`.
#[derive(Debug, Copy, Clone)]
pub struct Clock {
    anchor: Instant,
}

impl Clock {
    pub fn new(anchor: Instant) -> Self {
        Self { anchor }
    }

    pub fn now(&self, now: Instant) -> MonoNanos {
        now.duration_since(self.anchor).as_nanos() as MonoNanos
    }

    pub fn to_instant(&self, nanos: MonoNanos) -> Instant {
        if nanos >= 0 {
            self.anchor + Duration::from_nanos(nanos as u64)
        } else {
            self.anchor - Duration::from_nanos((-nanos) as u64)
        }
    }
}
