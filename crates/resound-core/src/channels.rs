use std::fmt;

use smallvec::SmallVec;

use crate::sample::CHANNELS_MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ChannelPosition {
    Mono,
    FrontLeft,
    FrontRight,
    FrontCenter,
    Lfe,
    RearLeft,
    RearRight,
    SideLeft,
    SideRight,
    Aux(u8),
}

impl fmt::Display for ChannelPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelPosition::Mono => f.write_str("mono"),
            ChannelPosition::FrontLeft => f.write_str("front-left"),
            ChannelPosition::FrontRight => f.write_str("front-right"),
            ChannelPosition::FrontCenter => f.write_str("front-center"),
            ChannelPosition::Lfe => f.write_str("lfe"),
            ChannelPosition::RearLeft => f.write_str("rear-left"),
            ChannelPosition::RearRight => f.write_str("rear-right"),
            ChannelPosition::SideLeft => f.write_str("side-left"),
            ChannelPosition::SideRight => f.write_str("side-right"),
            ChannelPosition::Aux(n) => write!(f, "aux{n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    positions: SmallVec<[ChannelPosition; 8]>,
}

impl ChannelMap {
    pub fn new(positions: impl IntoIterator<Item = ChannelPosition>) -> ChannelMap {
        ChannelMap {
            positions: positions.into_iter().collect(),
        }
    }

    /// The standard layout for a given channel count, matching what clients
    /// get when they don't ask for anything specific.
    pub fn default_for(channels: u8) -> ChannelMap {
        use ChannelPosition::*;

        debug_assert!(channels > 0 && channels <= CHANNELS_MAX);

        let positions: &[ChannelPosition] = match channels {
            1 => &[Mono],
            2 => &[FrontLeft, FrontRight],
            3 => &[FrontLeft, FrontRight, FrontCenter],
            4 => &[FrontLeft, FrontRight, RearLeft, RearRight],
            5 => &[FrontLeft, FrontRight, FrontCenter, RearLeft, RearRight],
            6 => &[FrontLeft, FrontRight, FrontCenter, Lfe, RearLeft, RearRight],
            _ => {
                return ChannelMap {
                    positions: (0..channels).map(Aux).collect(),
                }
            }
        };

        ChannelMap {
            positions: positions.iter().copied().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[ChannelPosition] {
        &self.positions
    }
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, position) in self.positions.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{position}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layouts() {
        assert_eq!(
            ChannelMap::default_for(1).positions(),
            &[ChannelPosition::Mono]
        );
        assert_eq!(
            ChannelMap::default_for(2).positions(),
            &[ChannelPosition::FrontLeft, ChannelPosition::FrontRight]
        );
        assert_eq!(ChannelMap::default_for(6).len(), 6);

        let wide = ChannelMap::default_for(10);
        assert_eq!(wide.len(), 10);
        assert_eq!(wide.positions()[0], ChannelPosition::Aux(0));
    }

    #[test]
    fn display() {
        let map = ChannelMap::default_for(2);
        assert_eq!(map.to_string(), "front-left,front-right");
    }
}
