use std::fmt;

use smallvec::SmallVec;

/// A single-channel software gain on a linear scale where
/// [`Volume::NORM`] is unity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Volume(u32);

impl Volume {
    pub const MUTED: Volume = Volume(0);
    pub const NORM: Volume = Volume(0x10000);

    pub const fn from_raw(raw: u32) -> Volume {
        Volume(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_linear(factor: f64) -> Volume {
        if factor <= 0.0 {
            return Volume::MUTED;
        }
        let raw = (factor * Volume::NORM.0 as f64).round();
        Volume(raw.min(u32::MAX as f64) as u32)
    }

    pub fn to_linear(self) -> f64 {
        self.0 as f64 / Volume::NORM.0 as f64
    }

    pub fn from_db(db: f64) -> Volume {
        Volume::from_linear(10f64.powf(db / 20.0))
    }

    /// Decibels relative to unity; muted maps to negative infinity.
    pub fn to_db(self) -> f64 {
        if self.is_muted() {
            return f64::NEG_INFINITY;
        }
        20.0 * self.to_linear().log10()
    }

    pub fn is_muted(self) -> bool {
        self == Volume::MUTED
    }

    pub fn is_norm(self) -> bool {
        self == Volume::NORM
    }

    pub fn multiply(self, other: Volume) -> Volume {
        let product = self.0 as u64 * other.0 as u64 / Volume::NORM.0 as u64;
        Volume(product.min(u32::MAX as u64) as u32)
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0 as u64 * 100 / Volume::NORM.0 as u64)
    }
}

/// A per-channel volume vector; its length always matches the channel count
/// of whatever sample spec it is paired with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CVolume {
    values: SmallVec<[Volume; 8]>,
}

impl CVolume {
    pub fn norm(channels: u8) -> CVolume {
        CVolume::uniform(channels, Volume::NORM)
    }

    pub fn muted(channels: u8) -> CVolume {
        CVolume::uniform(channels, Volume::MUTED)
    }

    pub fn uniform(channels: u8, volume: Volume) -> CVolume {
        CVolume {
            values: (0..channels).map(|_| volume).collect(),
        }
    }

    pub fn new(values: impl IntoIterator<Item = Volume>) -> CVolume {
        CVolume {
            values: values.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn channels(&self) -> &[Volume] {
        &self.values
    }

    pub fn get(&self, channel: usize) -> Volume {
        self.values[channel]
    }

    pub fn set(&mut self, channel: usize, volume: Volume) {
        self.values[channel] = volume;
    }

    pub fn is_norm(&self) -> bool {
        self.values.iter().all(|v| v.is_norm())
    }

    pub fn is_muted(&self) -> bool {
        self.values.iter().all(|v| v.is_muted())
    }

    pub fn avg(&self) -> Volume {
        if self.values.is_empty() {
            return Volume::MUTED;
        }
        let sum: u64 = self.values.iter().map(|v| v.raw() as u64).sum();
        Volume::from_raw((sum / self.values.len() as u64) as u32)
    }

    /// Pointwise product of two vectors of the same length.
    pub fn multiply(&self, other: &CVolume) -> CVolume {
        assert_eq!(self.len(), other.len());
        CVolume {
            values: self
                .values
                .iter()
                .zip(&other.values)
                .map(|(a, b)| a.multiply(*b))
                .collect(),
        }
    }
}
