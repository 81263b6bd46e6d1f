//! High-level components of the secure J1939 stack: network management,
//! application messages, the DM18 security layer, and CAN/TP transport.
pub mod managment;
pub mod messages;
pub mod security;
pub mod transport;

/// Normal J1939 priority used for control and data traffic.
pub const NORMAL_PRIORITY: u8 = 6;
/// Global (broadcast) destination address.
pub const GLOBAL_ADDRESS: u8 = 255;
