//! Native-token amounts for display.

use alloy_primitives::{
    U256,
    utils::{UnitsError, format_ether, parse_ether},
};

/// Formats `wei` as a decimal native-token string without trailing zeros,
/// e.g. `9000000000000000` -> `"0.009"`.
pub fn format_native(wei: U256) -> String {
    let formatted = format_ether(wei);
    match formatted.split_once('.') {
        Some((whole, fraction)) => {
            let fraction = fraction.trim_end_matches('0');
            if fraction.is_empty() {
                whole.to_owned()
            } else {
                format!("{whole}.{fraction}")
            }
        }
        None => formatted,
    }
}

/// Parses a decimal native-token amount such as `"0.1"` into wei.
pub fn parse_native(amount: &str) -> Result<U256, UnitsError> {
    parse_ether(amount.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(U256::ZERO, "0"; "zero")]
    #[test_case(U256::from(9_000_000_000_000_000u64), "0.009"; "shortfall")]
    #[test_case(U256::from(10u64).pow(U256::from(18)), "1"; "one token")]
    #[test_case(U256::from(1u64), "0.000000000000000001"; "one wei")]
    #[test_case(U256::from(2_500_000_000_000_000_000u64), "2.5"; "fractional")]
    fn formats_without_trailing_zeros(wei: U256, expected: &str) {
        assert_eq!(format_native(wei), expected);
    }

    #[test]
    fn parses_decimal_amounts() -> eyre::Result<()> {
        assert_eq!(
            parse_native(" 0.009 ")?,
            U256::from(9_000_000_000_000_000u64)
        );
        assert!(parse_native("lots").is_err());
        Ok(())
    }
}
