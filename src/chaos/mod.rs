//! Chaos fault injection
//!
//! Probabilistically transforms proxy behavior before the upstream call:
//! a `delay` rule sleeps then forwards normally, an `error` rule answers
//! locally and never dials upstream. Rules are evaluated in declaration
//! order against the request's model name.

use crate::config::{ChaosAction, ChaosSettings};
use http::StatusCode;
use parking_lot::RwLock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tracing::info;

/// Default status for an `error` rule that does not set one.
const DEFAULT_ERROR_STATUS: StatusCode = StatusCode::INTERNAL_SERVER_ERROR;

/// Default body for an `error` rule that does not set one.
const DEFAULT_ERROR_MESSAGE: &str = "Chaos Injection Error";

/// Outcome of a winning chaos rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    pub action: ChaosAction,
    pub delay: Duration,
    pub status: StatusCode,
    pub message: String,
    /// Human-readable description of the rule that fired, for logging.
    pub rule: String,
}

/// Evaluates configured chaos rules against incoming requests.
pub struct ChaosEngine {
    settings: ChaosSettings,
    rng: RwLock<StdRng>,
}

impl ChaosEngine {
    pub fn new(settings: ChaosSettings) -> Self {
        Self {
            settings,
            rng: RwLock::new(StdRng::from_entropy()),
        }
    }

    /// First rule whose model matches (case-insensitive exact, or `*`) and
    /// whose uniform draw lands under `rate` wins. Returns `None` when chaos
    /// is disabled or no rule fires.
    pub fn evaluate(&self, model: &str) -> Option<Injection> {
        if !self.settings.enabled {
            return None;
        }

        for rule in &self.settings.rules {
            if rule.model != "*" && !rule.model.eq_ignore_ascii_case(model) {
                continue;
            }
            let draw: f64 = self.rng.write().gen();
            if draw >= rule.rate {
                continue;
            }

            let status = match rule.action {
                ChaosAction::Error => {
                    StatusCode::from_u16(rule.status_code).unwrap_or(DEFAULT_ERROR_STATUS)
                }
                ChaosAction::Delay => StatusCode::OK,
            };
            let message = if rule.action == ChaosAction::Error && rule.message.is_empty() {
                DEFAULT_ERROR_MESSAGE.to_string()
            } else {
                rule.message.clone()
            };

            let injection = Injection {
                action: rule.action,
                delay: rule.delay,
                status,
                message,
                rule: format!("Rule[model={}, action={:?}]", rule.model, rule.action),
            };
            info!(model, rule = %injection.rule, "chaos rule matched");
            return Some(injection);
        }

        None
    }
}
