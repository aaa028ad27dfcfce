use std::fmt;
use std::str::FromStr;

/// A resource amount in milli-units, parsed from Kubernetes quantity notation.
///
/// `"1"` is 1000, `"250m"` is 250, `"1Gi"` is 1073741824000.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Quantity(i64);

impl Quantity {
    pub const ZERO: Quantity = Quantity(0);

    pub fn from_milli(milli: i64) -> Self {
        Self(milli)
    }

    pub fn milli(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Parse a quantity string, returning `None` if it is malformed or overflows.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(split);
        if number.is_empty() || number == "." {
            return None;
        }

        let (int_part, frac_part) = number.split_once('.').unwrap_or((number, ""));
        if frac_part.len() > 9 || frac_part.contains('.') {
            return None;
        }
        let scale = 10i128.pow(frac_part.len() as u32);
        let int_value: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().ok()?
        };
        let frac_value: i128 = if frac_part.is_empty() {
            0
        } else {
            frac_part.parse().ok()?
        };
        let mantissa = int_value.checked_mul(scale)?.checked_add(frac_value)?;

        let multiplier: i128 = match suffix {
            "m" => 1,
            "" => 1_000,
            "k" => 1_000 * 1_000,
            "M" => 1_000 * 1_000_000,
            "G" => 1_000 * 1_000_000_000,
            "T" => 1_000 * 1_000_000_000_000,
            "P" => 1_000 * 1_000_000_000_000_000,
            "E" => 1_000 * 1_000_000_000_000_000_000,
            "Ki" => 1_000 * (1 << 10),
            "Mi" => 1_000 * (1 << 20),
            "Gi" => 1_000 * (1 << 30),
            "Ti" => 1_000 * (1 << 40),
            "Pi" => 1_000 * (1 << 50),
            "Ei" => 1_000 * (1 << 60),
            _ => return None,
        };

        // Round up so that fractional milli-units are never under-requested.
        let scaled = mantissa.checked_mul(multiplier)?;
        let milli = scaled.checked_add(scale - 1)? / scale;
        i64::try_from(milli).ok().map(Quantity)
    }
}

impl FromStr for Quantity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse(s).ok_or_else(|| format!("invalid quantity {s:?}"))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 % 1000 == 0 {
            write!(f, "{}", self.0 / 1000)
        } else {
            write!(f, "{}m", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_milli_values() {
        assert_eq!(Quantity::parse("1"), Some(Quantity(1000)));
        assert_eq!(Quantity::parse("250m"), Some(Quantity(250)));
        assert_eq!(Quantity::parse("0.5"), Some(Quantity(500)));
        assert_eq!(Quantity::parse(" 2 "), Some(Quantity(2000)));
    }

    #[test]
    fn parses_decimal_and_binary_suffixes() {
        assert_eq!(Quantity::parse("1k"), Some(Quantity(1_000_000)));
        assert_eq!(Quantity::parse("1Ki"), Some(Quantity(1_024_000)));
        assert_eq!(Quantity::parse("1Gi").map(Quantity::milli), Some(1_073_741_824_000));
        assert_eq!(Quantity::parse("1.5G").map(Quantity::milli), Some(1_500_000_000_000));
    }

    #[test]
    fn rounds_fractional_milli_up() {
        assert_eq!(Quantity::parse("0.0001"), Some(Quantity(1)));
    }

    #[test]
    fn rejects_malformed_quantities() {
        assert_eq!(Quantity::parse(""), None);
        assert_eq!(Quantity::parse("abc"), None);
        assert_eq!(Quantity::parse("1X"), None);
        assert_eq!(Quantity::parse("1.2.3"), None);
        assert_eq!(Quantity::parse("-1"), None);
        // Overflows i64 milli-units.
        assert_eq!(Quantity::parse("100E"), None);
    }

    #[test]
    fn rejects_quantities_overflowing_while_rounding() {
        // The mantissa is exactly i128::MAX, so rounding up cannot be added.
        assert_eq!(Quantity::parse("17014118346046923173168730371588410572.7m"), None);
        assert_eq!(Quantity::parse("170141183460469231731687303715884105727m"), None);
    }

    #[test]
    fn display_round_trips_whole_units() {
        assert_eq!(Quantity::from_milli(3000).to_string(), "3");
        assert_eq!(Quantity::from_milli(1500).to_string(), "1500m");
    }
}
