//! Reconnection policy
//!
//! Decides whether, and after how long, a dropped link is re-established.
//! The textual form is what configuration files and the command line use:
//! `none`, `immediate` or `backoff(base, max, factor)` where `base` and
//! `max` are durations (`250ms`, `2s`, or bare milliseconds).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReconnectPolicy {
    /// Log the disconnect and stay idle.
    #[default]
    None,
    Immediate,
    Backoff {
        base: Duration,
        max: Duration,
        factor: f64,
    },
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based), or `None`
    /// if the policy never reconnects.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            ReconnectPolicy::None => None,
            ReconnectPolicy::Immediate => Some(Duration::ZERO),
            ReconnectPolicy::Backoff { base, max, factor } => {
                let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
                let scaled = base.as_secs_f64() * factor.powi(exp);
                if !scaled.is_finite() || scaled >= max.as_secs_f64() {
                    Some(*max)
                } else {
                    Some(Duration::from_secs_f64(scaled))
                }
            }
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid reconnect policy: {0}")]
pub struct PolicyParseError(String);

fn parse_duration(text: &str) -> Result<Duration, PolicyParseError> {
    let text = text.trim();
    let (number, scale) = if let Some(ms) = text.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(s) = text.strip_suffix('s') {
        (s, 1000)
    } else {
        (text, 1)
    };
    number
        .trim()
        .parse::<u64>()
        .map(|n| Duration::from_millis(n.saturating_mul(scale)))
        .map_err(|_| PolicyParseError(format!("bad duration {:?}", text)))
}

impl FromStr for ReconnectPolicy {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "none" => return Ok(ReconnectPolicy::None),
            "immediate" => return Ok(ReconnectPolicy::Immediate),
            _ => {}
        }

        let args = s
            .strip_prefix("backoff(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| PolicyParseError(s.to_string()))?;
        let parts: Vec<&str> = args.split(',').collect();
        if parts.len() != 3 {
            return Err(PolicyParseError(format!(
                "backoff takes 3 arguments, got {}",
                parts.len()
            )));
        }

        let base = parse_duration(parts[0])?;
        let max = parse_duration(parts[1])?;
        let factor: f64 = parts[2]
            .trim()
            .parse()
            .map_err(|_| PolicyParseError(format!("bad factor {:?}", parts[2].trim())))?;

        if !(factor.is_finite() && factor >= 1.0) {
            return Err(PolicyParseError("factor must be >= 1".to_string()));
        }
        if max < base {
            return Err(PolicyParseError("max must not be below base".to_string()));
        }
        Ok(ReconnectPolicy::Backoff { base, max, factor })
    }
}

impl fmt::Display for ReconnectPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconnectPolicy::None => f.write_str("none"),
            ReconnectPolicy::Immediate => f.write_str("immediate"),
            ReconnectPolicy::Backoff { base, max, factor } => write!(
                f,
                "backoff({}ms, {}ms, {})",
                base.as_millis(),
                max.as_millis(),
                factor
            ),
        }
    }
}

impl TryFrom<String> for ReconnectPolicy {
    type Error = PolicyParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReconnectPolicy> for String {
    fn from(policy: ReconnectPolicy) -> Self {
        policy.to_string()
    }
}
