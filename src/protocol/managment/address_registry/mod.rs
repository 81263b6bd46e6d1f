//! Bounded registry binding network source addresses to small indices.
//!
//! Every per-peer table of the stack (transport reassembly, pending transfers)
//! is keyed by the [`PeerIndex`] handed out here, and every security session
//! by the [`CmacIndex`] of a configured vehicle address. Handles can only be
//! created by the registry, so they are always within bounds.
//!
//! # Capacity policy
//!
//! The address table is a fixed ring of [`N_SOURCE_ADDRESSES`] slots. Once
//! full, the write cursor wraps and the oldest mapping is overwritten. The
//! caller is told which address was evicted so it can discard the transport
//! state still bound to the reused index. Security sessions are keyed by
//! [`CmacIndex`] and are not affected by eviction.

/// Capacity of the address table and of the vehicle address list.
pub const N_SOURCE_ADDRESSES: usize = 24;

//==================================================================================Handles
/// Index bound to a source address seen on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerIndex(u8);

impl PeerIndex {
    #[inline]
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

/// Index of a configured vehicle peer, keying its security session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CmacIndex(u8);

impl CmacIndex {
    #[inline]
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

/// Outcome of [`AddressRegistry::assign`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Assignment {
    pub index: PeerIndex,
    /// Address whose mapping was overwritten to make room, if any.
    pub evicted: Option<u8>,
}

//==================================================================================Registry
#[derive(Debug, Clone)]
pub struct AddressRegistry {
    slots: [Option<u8>; N_SOURCE_ADDRESSES],
    cursor: usize,
    vehicle_addresses: heapless::Vec<u8, N_SOURCE_ADDRESSES>,
}

impl AddressRegistry {
    /// Create an empty address table with the given vehicle allow-list.
    /// Entries beyond [`N_SOURCE_ADDRESSES`] are ignored.
    pub fn new(vehicle_addresses: &[u8]) -> Self {
        let mut list = heapless::Vec::new();
        for &address in vehicle_addresses.iter().take(N_SOURCE_ADDRESSES) {
            // Capacity is guaranteed by `take`.
            let _ = list.push(address);
        }
        Self {
            slots: [None; N_SOURCE_ADDRESSES],
            cursor: 0,
            vehicle_addresses: list,
        }
    }

    /// Index for `address`, assigning the next ring slot on first sighting.
    pub fn resolve_or_assign(&mut self, address: u8) -> PeerIndex {
        self.assign(address).index
    }

    /// Same as [`resolve_or_assign`](Self::resolve_or_assign) but reports the
    /// mapping overwritten when the ring wrapped.
    pub fn assign(&mut self, address: u8) -> Assignment {
        if let Some(index) = self.lookup(address) {
            return Assignment {
                index,
                evicted: None,
            };
        }

        let slot = self.cursor;
        let evicted = self.slots[slot].replace(address);
        self.cursor += 1;
        if self.cursor >= N_SOURCE_ADDRESSES {
            #[cfg(feature = "defmt")]
            defmt::warn!("Source address space exceeded, wrapping registry cursor");
            self.cursor = 0;
        }

        if let Some(_old) = evicted {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "Registry slot {} reassigned from {:02X} to {:02X}",
                slot,
                _old,
                address
            );
        }

        Assignment {
            index: PeerIndex(slot as u8),
            evicted,
        }
    }

    /// Index currently bound to `address`, without assigning one.
    pub fn lookup(&self, address: u8) -> Option<PeerIndex> {
        self.slots
            .iter()
            .position(|slot| *slot == Some(address))
            .map(|i| PeerIndex(i as u8))
    }

    /// Address currently bound to `index`.
    pub fn address_of(&self, index: PeerIndex) -> Option<u8> {
        self.slots[index.get()]
    }

    /// Session index of a recognized vehicle peer. `None` means no secure
    /// session applies to this address.
    pub fn cmac_index_for(&self, address: u8) -> Option<CmacIndex> {
        self.vehicle_addresses
            .iter()
            .position(|&a| a == address)
            .map(|i| CmacIndex(i as u8))
    }

    /// Vehicle address behind a session index.
    pub fn vehicle_address(&self, index: CmacIndex) -> u8 {
        self.vehicle_addresses[index.get()]
    }

    /// All session indices, in configuration order.
    pub fn cmac_indices(&self) -> impl Iterator<Item = CmacIndex> + '_ {
        (0..self.vehicle_addresses.len()).map(|i| CmacIndex(i as u8))
    }
}
