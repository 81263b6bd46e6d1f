//! Configuration builder and non-volatile image parsing.
use super::*;

fn image() -> [u8; 256] {
    let mut image = [0xFFu8; 256];
    image[IMAGE_SELF_ADDRESS] = 0x25;
    image[IMAGE_ECU_COUNT] = 2;
    image[IMAGE_ECU_ADDRESSES..IMAGE_ECU_ADDRESSES + 2].copy_from_slice(&[0x00, 0x03]);
    image[IMAGE_VEHICLE_COUNT] = 3;
    image[IMAGE_VEHICLE_ADDRESSES..IMAGE_VEHICLE_ADDRESSES + 3].copy_from_slice(&[0x0B, 0x00, 0x17]);
    image
}

#[test]
/// Addresses are read from their documented offsets.
fn test_image_layout() {
    let config = SecureConfig::from_eeprom_image(&image()).unwrap();
    assert_eq!(config.self_address, 0x25);
    assert_eq!(config.ecu_addresses.as_slice(), &[0x00, 0x03]);
    assert_eq!(config.vehicle_addresses.as_slice(), &[0x0B, 0x00, 0x17]);
    assert_eq!(config.identity, None);
}

#[test]
/// Short images and counts beyond capacity are refused.
fn test_image_errors() {
    assert_eq!(
        SecureConfig::from_eeprom_image(&image()[..200]),
        Err(ConfigError::ImageTooShort {
            len: 200,
            expected: IMAGE_LEN,
        })
    );

    let mut bad = image();
    bad[IMAGE_VEHICLE_COUNT] = 25;
    assert_eq!(
        SecureConfig::from_eeprom_image(&bad),
        Err(ConfigError::TooManyAddresses {
            count: 25,
            capacity: N_SOURCE_ADDRESSES,
        })
    );
}

#[test]
/// Builder path used when the configuration is compiled in.
fn test_builder() {
    let config = SecureConfig::new(0x25)
        .with_vehicle_addresses(&[0x0B])
        .unwrap()
        .with_identity(ComponentIdentity::new("SSS2", "1").unwrap());
    assert_eq!(config.vehicle_addresses.as_slice(), &[0x0B]);
    assert!(config.identity.is_some());

    assert!(SecureConfig::new(0x25)
        .with_ecu_addresses(&[0u8; 25])
        .is_err());
}
