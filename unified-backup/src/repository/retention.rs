use std::fmt;
use std::str::FromStr;

use crate::utils::OrchestratorError;

/// Duration expression accepted by the engine's `--keep-within`, e.g. `7d`
/// or `1y6m`. Units: `y`, `m` (months), `d`, `h`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionWindow(String);

impl RetentionWindow {
    /// Window of whole days. Zero is rejected like `"0d"` is.
    pub fn days(days: u32) -> Result<Self, OrchestratorError> {
        if days == 0 {
            return Err(OrchestratorError::Config(
                "retention window must be at least one day".to_string(),
            ));
        }
        Ok(Self(format!("{days}d")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RetentionWindow {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || OrchestratorError::Config(format!("invalid retention window '{s}'"));

        if s.is_empty() {
            return Err(invalid());
        }

        let mut digits = 0usize;
        let mut total = 0u64;
        for c in s.chars() {
            if let Some(d) = c.to_digit(10) {
                digits += 1;
                total = total.saturating_mul(10).saturating_add(u64::from(d));
            } else if matches!(c, 'y' | 'm' | 'd' | 'h') && digits > 0 {
                digits = 0;
            } else {
                return Err(invalid());
            }
        }

        // Trailing number without unit, or a window of zero length.
        if digits > 0 || total == 0 {
            return Err(invalid());
        }

        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for RetentionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
