//! Per-execution capability gate for the script runtime.
//!
//! By default a script has no filesystem access at all (never exposed as a
//! global, regardless of config); network is opt-in; logging is opt-in but
//! defaults on. This module only decides what's *allowed* -- `globals.rs`
//! wires the decision into which globals actually get installed.

pub use crate::events::subscriber::Capabilities;

impl Capabilities {
    #[must_use]
    pub fn strict_default() -> Self {
        Self { network: false, logging: true, strict: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_capabilities_deny_network_allow_logging() {
        let caps = Capabilities::default();
        assert!(!caps.network);
        assert!(caps.logging);
        assert!(!caps.strict);
    }
}
