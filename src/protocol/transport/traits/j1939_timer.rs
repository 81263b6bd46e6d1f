//! Timer abstraction providing the pacing delays of the transport layer and
//! the monotonic clock the security sessions measure their age against.
use embassy_time::Instant;

/// Timer trait abstraction; must remain thread-safe when applicable.
pub trait J1939Timer {
    /// Asynchronously wait for `millis` milliseconds.
    fn delay_ms<'a>(
        &'a mut self,
        millis: u32,
    ) -> impl core::future::Future<Output = ()> + 'a;

    /// Current monotonic time.
    fn now(&self) -> Instant;
}
