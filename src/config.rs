//! Ambient configuration surface (§6 + SPEC_FULL.md's ADDED section):
//! `GREENHUB_BACKEND`/`GREENHUB_CLOCK`/`GREENHUB_DEBUG_BLOCKING`, read via
//! plain `std::env::var` parsing — no config-file framework, matching the
//! teacher crate's own zero-config philosophy.

use std::env;

use crate::clock::{AnyClock, ManualClock, MonotonicClock};

/// Construction-time configuration for a [`crate::Hub`].
pub struct Config {
    pub(crate) backend_override: Option<String>,
    pub(crate) clock: AnyClock,
    pub(crate) debug_blocking: bool,
    pub(crate) allow_secondary_waiters: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            backend_override: None,
            clock: AnyClock::Monotonic(MonotonicClock::new()),
            debug_blocking: false,
            allow_secondary_waiters: false,
        }
    }
}

impl Config {
    /// Read `GREENHUB_BACKEND`/`GREENHUB_CLOCK`/`GREENHUB_DEBUG_BLOCKING`
    /// from the environment. Unset variables fall back to the defaults
    /// ([`ConfigBuilder::default`]'s values).
    pub fn from_env() -> Config {
        let mut builder = ConfigBuilder::default();

        if let Ok(backend) = env::var("GREENHUB_BACKEND") {
            builder = builder.backend(backend);
        }

        match env::var("GREENHUB_CLOCK").as_deref() {
            Ok("manual") => builder = builder.clock(AnyClock::Manual(ManualClock::new())),
            Ok("monotonic") | Err(_) => {}
            Ok(other) => {
                log::warn!("greenhub: ignoring unrecognized GREENHUB_CLOCK={other:?}");
            }
        }

        if let Ok(flag) = env::var("GREENHUB_DEBUG_BLOCKING") {
            builder = builder.debug_blocking(flag == "1");
        }

        builder.build()
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Explicit escape hatch for embedders who don't want environment-variable
/// coupling.
pub struct ConfigBuilder {
    inner: Config,
}

impl Default for ConfigBuilder {
    fn default() -> ConfigBuilder {
        ConfigBuilder {
            inner: Config::default(),
        }
    }
}

impl ConfigBuilder {
    pub fn backend(mut self, name: impl Into<String>) -> ConfigBuilder {
        self.inner.backend_override = Some(name.into());
        self
    }

    pub fn clock(mut self, clock: AnyClock) -> ConfigBuilder {
        self.inner.clock = clock;
        self
    }

    pub fn debug_blocking(mut self, enabled: bool) -> ConfigBuilder {
        self.inner.debug_blocking = enabled;
        self
    }

    /// Toggle the "prevent multiple readers/writers" policy (§4.1),
    /// on by default.
    pub fn allow_secondary_waiters(mut self, allow: bool) -> ConfigBuilder {
        self.inner.allow_secondary_waiters = allow;
        self
    }

    pub fn build(self) -> Config {
        self.inner
    }
}
