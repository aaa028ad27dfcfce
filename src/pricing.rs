//! Bid types consumed by the job database. How bids are computed lives
//! elsewhere; jobs only store and resolve them.

use serde::{Deserialize, Serialize};

/// Bid assigned to running jobs that cannot be preempted, so that price-based
/// preemption never selects them.
pub const NON_PREEMPTIBLE_RUNNING_PRICE: f64 = 1_000_000_000.0;

/// The price a job bids in a pool, depending on whether it is queued or running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub queued_bid: f64,
    pub running_bid: f64,
}

impl Bid {
    pub fn new(queued_bid: f64, running_bid: f64) -> Self {
        Self {
            queued_bid,
            running_bid,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PriceBand {
    #[default]
    Unspecified,
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
}

impl From<i32> for PriceBand {
    /// Repository encoding; unrecognised values map to `Unspecified`.
    fn from(value: i32) -> Self {
        match value {
            1 => PriceBand::A,
            2 => PriceBand::B,
            3 => PriceBand::C,
            4 => PriceBand::D,
            5 => PriceBand::E,
            6 => PriceBand::F,
            7 => PriceBand::G,
            8 => PriceBand::H,
            _ => PriceBand::Unspecified,
        }
    }
}

impl From<PriceBand> for i32 {
    fn from(band: PriceBand) -> Self {
        match band {
            PriceBand::Unspecified => 0,
            PriceBand::A => 1,
            PriceBand::B => 2,
            PriceBand::C => 3,
            PriceBand::D => 4,
            PriceBand::E => 5,
            PriceBand::F => 6,
            PriceBand::G => 7,
            PriceBand::H => 8,
        }
    }
}

impl std::fmt::Display for PriceBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PriceBand::Unspecified => write!(f, "unspecified"),
            PriceBand::A => write!(f, "A"),
            PriceBand::B => write!(f, "B"),
            PriceBand::C => write!(f, "C"),
            PriceBand::D => write!(f, "D"),
            PriceBand::E => write!(f, "E"),
            PriceBand::F => write!(f, "F"),
            PriceBand::G => write!(f, "G"),
            PriceBand::H => write!(f, "H"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_band_from_repository_value() {
        assert_eq!(PriceBand::from(0), PriceBand::Unspecified);
        assert_eq!(PriceBand::from(3), PriceBand::C);
        assert_eq!(PriceBand::from(42), PriceBand::Unspecified);
        assert_eq!(i32::from(PriceBand::H), 8);
    }

    #[test]
    fn non_preemptible_price_dominates_realistic_bids() {
        let bid = Bid::new(1e6, 1e7);
        assert!(NON_PREEMPTIBLE_RUNNING_PRICE > bid.running_bid);
    }
}
