use std::{fmt, str::FromStr};

use crate::error::FieldbusError;

/// Bit inside a data-block image, written `<byte>.<bit>` as on the PLC side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BitAddress {
    pub byte: usize,
    pub bit: u8,
}

impl BitAddress {
    pub const fn new(byte: usize, bit: u8) -> Self {
        Self { byte, bit }
    }

    /// Bits outside the image read as false.
    pub fn get(&self, image: &[u8]) -> bool {
        image
            .get(self.byte)
            .map(|b| b & (1 << self.bit) != 0)
            .unwrap_or(false)
    }

    pub fn set(&self, image: &mut [u8], value: bool) -> Result<(), FieldbusError> {
        let slot = image
            .get_mut(self.byte)
            .ok_or_else(|| FieldbusError::BitAddress(self.to_string()))?;
        if value {
            *slot |= 1 << self.bit;
        } else {
            *slot &= !(1 << self.bit);
        }
        Ok(())
    }
}

impl fmt::Display for BitAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.byte, self.bit)
    }
}

impl FromStr for BitAddress {
    type Err = FieldbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FieldbusError::BitAddress(s.to_string());
        let (byte, bit) = s.trim().split_once('.').ok_or_else(invalid)?;
        let byte = byte.parse::<usize>().map_err(|_| invalid())?;
        let bit = bit.parse::<u8>().map_err(|_| invalid())?;
        if bit > 7 {
            return Err(invalid());
        }
        Ok(Self { byte, bit })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_and_display() {
        let addr: BitAddress = "1.6".parse().unwrap();
        assert_eq!(addr, BitAddress::new(1, 6));
        assert_eq!(addr.to_string(), "1.6");
        assert!("1.8".parse::<BitAddress>().is_err());
        assert!("16".parse::<BitAddress>().is_err());
        assert!("a.1".parse::<BitAddress>().is_err());
    }

    #[test]
    fn test_get_reads_plc_bit_order() {
        let image = [0b0000_0101, 0b0101_0000, 0b0000_0001];
        assert!(BitAddress::new(0, 0).get(&image));
        assert!(!BitAddress::new(0, 1).get(&image));
        assert!(BitAddress::new(0, 2).get(&image));
        assert!(BitAddress::new(1, 4).get(&image));
        assert!(BitAddress::new(1, 6).get(&image));
        assert!(BitAddress::new(2, 0).get(&image));
        assert!(!BitAddress::new(5, 0).get(&image));
    }

    #[test]
    fn test_set_out_of_range_fails() {
        let mut image = [0u8; 2];
        assert!(BitAddress::new(2, 0).set(&mut image, true).is_err());
    }

    proptest! {
        #[test]
        fn set_touches_only_one_bit(byte in 0usize..4, bit in 0u8..8, seed in any::<[u8; 4]>(), value in any::<bool>()) {
            let mut image = seed;
            let addr = BitAddress::new(byte, bit);
            addr.set(&mut image, value).unwrap();
            prop_assert_eq!(addr.get(&image), value);
            for other_byte in 0..4 {
                for other_bit in 0..8u8 {
                    if (other_byte, other_bit) != (byte, bit) {
                        let other = BitAddress::new(other_byte, other_bit);
                        prop_assert_eq!(other.get(&image), other.get(&seed));
                    }
                }
            }
        }
    }
}
