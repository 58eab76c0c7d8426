//! ISO-8601 duration parsing for watchdog limits (`PT20S`, `PT10M`, `P1DT2H`)

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid ISO-8601 duration '{input}': {reason}")]
pub struct DurationError {
    pub input: String,
    pub reason: String,
}

impl DurationError {
    fn new(input: &str, reason: &str) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Parse `P[nW][nD][T[nH][nM][nS]]` into a [`Duration`]
///
/// Year and month designators are rejected since they have no fixed length.
/// Only the seconds component may carry a fractional part.
pub fn parse_iso8601(input: &str) -> Result<Duration, DurationError> {
    let rest = input
        .strip_prefix('P')
        .ok_or_else(|| DurationError::new(input, "must start with 'P'"))?;
    if rest.is_empty() {
        return Err(DurationError::new(input, "no components"));
    }

    let mut seconds = 0f64;
    let mut in_time = false;
    let mut number = String::new();
    let mut components = 0;

    for c in rest.chars() {
        match c {
            'T' if !in_time => {
                if !number.is_empty() {
                    return Err(DurationError::new(input, "number without designator"));
                }
                in_time = true;
            }
            '0'..='9' | '.' | ',' => number.push(if c == ',' { '.' } else { c }),
            _ => {
                let value: f64 = number
                    .parse()
                    .map_err(|_| DurationError::new(input, "missing or malformed number"))?;
                if value.fract() != 0.0 && !(in_time && c == 'S') {
                    return Err(DurationError::new(input, "fractions only allowed on seconds"));
                }
                let unit = match (in_time, c) {
                    (false, 'W') => 7.0 * 86_400.0,
                    (false, 'D') => 86_400.0,
                    (false, 'Y') | (false, 'M') => {
                        return Err(DurationError::new(input, "years and months are not supported"))
                    }
                    (true, 'H') => 3_600.0,
                    (true, 'M') => 60.0,
                    (true, 'S') => 1.0,
                    _ => return Err(DurationError::new(input, "unexpected designator")),
                };
                seconds += value * unit;
                number.clear();
                components += 1;
            }
        }
    }

    if !number.is_empty() {
        return Err(DurationError::new(input, "trailing number without designator"));
    }
    if components == 0 {
        return Err(DurationError::new(input, "no components"));
    }

    Duration::try_from_secs_f64(seconds).map_err(|_| DurationError::new(input, "out of range"))
}

/// Format a duration the way it is written in inventory files
pub fn format_iso8601(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::from("PT");
    if hours > 0 {
        out.push_str(&format!("{}H", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}M", minutes));
    }
    if secs > 0 || out.len() == 2 {
        out.push_str(&format!("{}S", secs));
    }
    out
}
