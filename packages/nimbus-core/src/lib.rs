//! Nimbus core -- the dynamic value model, event clock, and shared error
//! type used by every subsystem of the Nimbus engine:
//!
//! - **Value** ([`value`]): the `Value` sum type used for script/jq interop
//!   and the HTTP gateway's JSON surface, plus explicit byte<->JSON
//!   conversion at the storage boundary.
//! - **Clock** ([`clock`]): single-process, strictly-increasing event
//!   timestamps (`EventClock`/`EventTimestamp`).
//! - **Error** ([`error`]): `EngineError`, the closed error enum surfaced
//!   at every API boundary.

pub mod clock;
pub mod error;
pub mod value;

pub use clock::{ClockSource, EventClock, EventTimestamp, SystemClock};
pub use error::{EngineError, EngineResult};
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    #[test]
    fn reexports_accessible() {
        let _ = Value::Null;
        let _clock = EventClock::system();
        let _ = EngineError::Cancelled;
    }
}
