//! Dispatcher configuration.
//!
//! A service is configured either with in-process workers or with the names
//! of worker queues on a broker. The variant is fixed when the dispatcher is
//! built and decides how every request is executed.

use std::collections::HashMap;

use crate::error::ConfigError;
use crate::worker::WorkerHandle;

/// Bounds for the size-based priority of queued requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityLimits {
    max_priority: u8,
    max_length: usize,
}

impl PriorityLimits {
    pub fn new(max_priority: u32, max_length: usize) -> Result<Self, ConfigError> {
        let max_priority = u8::try_from(max_priority)
            .ok()
            .filter(|p| *p > 0)
            .ok_or(ConfigError::InvalidMaxPriority(max_priority))?;

        if max_length == 0 {
            return Err(ConfigError::InvalidMaxLength);
        }

        Ok(Self {
            max_priority,
            max_length,
        })
    }

    pub fn max_priority(&self) -> u8 {
        self.max_priority
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Priority for a request of the given length.
    ///
    /// Computed as `ceil((max_length - length + 1) / (max_length / max_priority))`
    /// and capped at `max_priority`. Shorter requests get higher priority.
    /// Returns `None` when the request is too long to be queued.
    pub fn priority(&self, length: usize) -> Option<u8> {
        let max_length = self.max_length as f64;
        let step = max_length / f64::from(self.max_priority);
        let raw = ((max_length - length as f64 + 1.0) / step).ceil();

        if raw <= 0.0 {
            None
        } else {
            Some(raw.min(f64::from(self.max_priority)) as u8)
        }
    }
}

impl Default for PriorityLimits {
    fn default() -> Self {
        Self {
            max_priority: 10,
            max_length: 20000,
        }
    }
}

/// Broker connection and routing parameters for remote execution.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub url: String,
    pub exchange: String,
    pub limits: PriorityLimits,
}

/// Token-to-worker mapping, in-process or remote.
#[derive(Debug, Clone)]
pub enum Targets {
    Local(HashMap<String, WorkerHandle>),
    Remote {
        queues: HashMap<String, String>,
        broker: BrokerSettings,
    },
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    targets: Targets,
    application_required: bool,
}

impl ServiceConfig {
    /// Serve requests with in-process workers.
    pub fn local(workers: HashMap<String, WorkerHandle>) -> Result<Self, ConfigError> {
        if workers.is_empty() {
            return Err(ConfigError::NoTokens);
        }
        Ok(Self {
            targets: Targets::Local(workers),
            application_required: false,
        })
    }

    /// Serve requests through worker queues.
    pub fn remote(
        queues: HashMap<String, String>,
        broker: BrokerSettings,
    ) -> Result<Self, ConfigError> {
        if queues.is_empty() {
            return Err(ConfigError::NoTokens);
        }
        Ok(Self {
            targets: Targets::Remote { queues, broker },
            application_required: false,
        })
    }

    /// Reject requests without an `application` header.
    pub fn with_application_required(mut self, required: bool) -> Self {
        self.application_required = required;
        self
    }

    pub fn application_required(&self) -> bool {
        self.application_required
    }

    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    pub(crate) fn into_parts(self) -> (Targets, bool) {
        (self.targets, self.application_required)
    }
}
