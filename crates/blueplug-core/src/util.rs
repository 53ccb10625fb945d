//! Helpers for turning btleplug handles into device identities.

use blueplug_types::DeviceIdentity;
use btleplug::platform::PeripheralId;

/// Address reported by platforms that hide the real Bluetooth address.
const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Format a peripheral ID as a string.
///
/// On macOS, peripheral IDs are UUIDs. On other platforms they wrap the
/// Bluetooth address or a D-Bus path. This strips the `PeripheralId(..)`
/// wrapper from the debug representation.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    strip_peripheral_id_wrapper(&format!("{:?}", id)).to_string()
}

fn strip_peripheral_id_wrapper(debug: &str) -> &str {
    debug
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
}

/// Create an identity from an address and peripheral ID.
///
/// Uses the Bluetooth address when the platform reports one, otherwise the
/// peripheral ID.
pub fn create_identifier(address: &str, peripheral_id: &PeripheralId) -> DeviceIdentity {
    if is_hidden_address(address) {
        DeviceIdentity::new(format_peripheral_id(peripheral_id))
    } else {
        DeviceIdentity::new(address)
    }
}

fn is_hidden_address(address: &str) -> bool {
    address.is_empty() || address == HIDDEN_ADDRESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_peripheral_id_wrapper() {
        assert_eq!(
            strip_peripheral_id_wrapper("PeripheralId(AA:BB:CC:DD:EE:FF)"),
            "AA:BB:CC:DD:EE:FF"
        );
        assert_eq!(strip_peripheral_id_wrapper("hci0/dev_AA"), "hci0/dev_AA");
    }

    #[test]
    fn test_hidden_address() {
        assert!(is_hidden_address("00:00:00:00:00:00"));
        assert!(is_hidden_address(""));
        assert!(!is_hidden_address("AA:BB:CC:DD:EE:FF"));
    }
}
