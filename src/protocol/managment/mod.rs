//! Network management logic: the address registry every per-peer table is
//! keyed by, the synchronous secure stack, and the async surfaces driving it
//! on a CAN bus.
pub mod address_registry;
pub mod secure_node;
pub mod secure_stack;
pub mod secure_supervisor;
