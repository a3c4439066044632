//! Sandboxed script evaluation shared by event subscriptions (§4.D), the
//! view engine's filter/transform/sort scripts (§4.F), and nowhere else --
//! the transform engine uses jq, not this module, for its expressions.

pub mod capabilities;
pub mod globals;
pub mod runtime;

pub use capabilities::Capabilities;
pub use runtime::ScriptRuntime;
