use std::fmt;
use std::ops::{Add, AddAssign, Sub};

const USEC_IN_MSEC: u64 = 1_000;
const USEC_IN_SEC: u64 = 1_000_000;

/// A duration or latency in the microsecond time domain of the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MicroSeconds {
    usec: u64,
}

impl MicroSeconds {
    pub const ZERO: MicroSeconds = MicroSeconds::from_micros(0);
    pub const MAX: MicroSeconds = MicroSeconds::from_micros(u64::MAX);

    pub const fn from_micros(usec: u64) -> MicroSeconds {
        MicroSeconds { usec }
    }

    pub const fn from_millis(msec: u64) -> MicroSeconds {
        MicroSeconds::from_micros(msec * USEC_IN_MSEC)
    }

    pub const fn from_secs(sec: u64) -> MicroSeconds {
        MicroSeconds::from_micros(sec * USEC_IN_SEC)
    }

    pub fn as_micros(self) -> u64 {
        self.usec
    }

    pub fn is_zero(self) -> bool {
        self.usec == 0
    }

    pub fn clamp(self, min: MicroSeconds, max: MicroSeconds) -> MicroSeconds {
        MicroSeconds::from_micros(self.usec.clamp(min.usec, max.usec))
    }
}

impl Add<MicroSeconds> for MicroSeconds {
    type Output = MicroSeconds;

    fn add(self, rhs: MicroSeconds) -> MicroSeconds {
        MicroSeconds::from_micros(self.usec + rhs.usec)
    }
}

impl AddAssign<MicroSeconds> for MicroSeconds {
    fn add_assign(&mut self, rhs: MicroSeconds) {
        self.usec += rhs.usec;
    }
}

impl Sub<MicroSeconds> for MicroSeconds {
    type Output = MicroSeconds;

    fn sub(self, rhs: MicroSeconds) -> MicroSeconds {
        MicroSeconds::from_micros(self.usec.saturating_sub(rhs.usec))
    }
}

impl fmt::Display for MicroSeconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.usec)
    }
}
