//! Device configuration: own source address, the address lists of both buses
//! and the optional component identity.
//!
//! The configuration can be built in code or read from the controller's
//! non-volatile image:
//!
//! ```text
//! offset 160        self source address
//! offset 161        ECU address count
//! offset 162..186   ECU addresses
//! offset 186        vehicle address count
//! offset 187..211   vehicle addresses
//! ```
use crate::error::ConfigError;
use crate::protocol::managment::address_registry::N_SOURCE_ADDRESSES;
use crate::protocol::messages::ComponentIdentity;

pub const IMAGE_SELF_ADDRESS: usize = 160;
pub const IMAGE_ECU_COUNT: usize = 161;
pub const IMAGE_ECU_ADDRESSES: usize = 162;
pub const IMAGE_VEHICLE_COUNT: usize = 186;
pub const IMAGE_VEHICLE_ADDRESSES: usize = 187;
/// Minimum image length covering every field above.
pub const IMAGE_LEN: usize = IMAGE_VEHICLE_ADDRESSES + N_SOURCE_ADDRESSES;

pub type AddressList = heapless::Vec<u8, N_SOURCE_ADDRESSES>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureConfig {
    /// Source address used for every frame this device sends.
    pub self_address: u8,
    /// Controllers on the ECU side. Configuration only: the stack does not
    /// read it; the application uses it to decide what to bridge between buses.
    pub ecu_addresses: AddressList,
    /// Vehicle-side peers that get a secure session, in session index order.
    pub vehicle_addresses: AddressList,
    /// Answer Component ID requests when set.
    pub identity: Option<ComponentIdentity>,
}

impl SecureConfig {
    pub fn new(self_address: u8) -> Self {
        Self {
            self_address,
            ecu_addresses: AddressList::new(),
            vehicle_addresses: AddressList::new(),
            identity: None,
        }
    }

    pub fn with_vehicle_addresses(mut self, addresses: &[u8]) -> Result<Self, ConfigError> {
        self.vehicle_addresses = address_list(addresses)?;
        Ok(self)
    }

    pub fn with_ecu_addresses(mut self, addresses: &[u8]) -> Result<Self, ConfigError> {
        self.ecu_addresses = address_list(addresses)?;
        Ok(self)
    }

    pub fn with_identity(mut self, identity: ComponentIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Parse the address section of the non-volatile image.
    pub fn from_eeprom_image(image: &[u8]) -> Result<Self, ConfigError> {
        if image.len() < IMAGE_LEN {
            return Err(ConfigError::ImageTooShort {
                len: image.len(),
                expected: IMAGE_LEN,
            });
        }

        let ecu_count = image[IMAGE_ECU_COUNT] as usize;
        let vehicle_count = image[IMAGE_VEHICLE_COUNT] as usize;
        for count in [ecu_count, vehicle_count] {
            if count > N_SOURCE_ADDRESSES {
                return Err(ConfigError::TooManyAddresses {
                    count,
                    capacity: N_SOURCE_ADDRESSES,
                });
            }
        }

        let config = Self::new(image[IMAGE_SELF_ADDRESS])
            .with_ecu_addresses(&image[IMAGE_ECU_ADDRESSES..IMAGE_ECU_ADDRESSES + ecu_count])?
            .with_vehicle_addresses(
                &image[IMAGE_VEHICLE_ADDRESSES..IMAGE_VEHICLE_ADDRESSES + vehicle_count],
            )?;

        #[cfg(feature = "defmt")]
        defmt::info!(
            "Configuration loaded: self {:02X}, {} ECU, {} vehicle addresses",
            config.self_address,
            ecu_count,
            vehicle_count
        );
        Ok(config)
    }
}

fn address_list(addresses: &[u8]) -> Result<AddressList, ConfigError> {
    AddressList::from_slice(addresses).map_err(|_| ConfigError::TooManyAddresses {
        count: addresses.len(),
        capacity: N_SOURCE_ADDRESSES,
    })
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
