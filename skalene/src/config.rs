//! Device configuration.
//!
//! A [`DeviceConfig`] is either complete and in range, or rejected with one
//! message per offending field. Field names follow the JSON representation
//! (`windowSize`, `leds[2]`, ...).

use crate::error::{Error, Result};
use crate::protocol::text::CommandCode;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;

/// Number of LED channels.
pub const LED_COUNT: usize = 8;

/// Number of tokens in a GET_CONFIG reply: code, five timings, LEDs, status.
pub const CONFIG_REPLY_FIELDS: usize = 15;

/// Valid window size range.
pub const WINDOW_SIZE_RANGE: RangeInclusive<i64> = 0..=3000;
/// Valid discharge time range (ms).
pub const DISCHARGE_TIME_RANGE: RangeInclusive<i64> = 50..=1000;
/// Valid integration time range (ms).
pub const INTEGRATION_TIME_RANGE: RangeInclusive<i64> = 50..=5000;
/// Valid start trigger modes.
pub const START_TRIGGER_RANGE: RangeInclusive<i64> = 0..=2;
/// Valid stop trigger modes.
pub const STOP_TRIGGER_RANGE: RangeInclusive<i64> = 0..=1;
/// Valid LED power range (percent).
pub const LED_RANGE: RangeInclusive<i64> = 0..=100;

/// Instrument configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    /// Peak detection window size.
    pub window_size: u16,
    /// Discharge time in milliseconds.
    pub discharge_time: u16,
    /// Integration time in milliseconds.
    pub integration_time: u16,
    /// Start trigger mode.
    pub start_trigger: u8,
    /// Stop trigger mode.
    pub stop_trigger: u8,
    /// LED power per channel, in percent.
    pub leds: [u8; LED_COUNT],
}

/// Per-field validation messages, keyed by JSON field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ConfigErrors(BTreeMap<String, String>);

impl ConfigErrors {
    pub(crate) fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::default();
        errors.insert(field, message);
        errors
    }

    fn insert(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.insert(field.into(), message.into());
    }

    /// Whether no field failed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of failed fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Message for `field`, if it failed.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Failed field names, sorted.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// `(field, message)` pairs, sorted by field.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, message)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{field}: {message}")?;
        }
        Ok(())
    }
}

/// Unvalidated field values, as text.
struct Candidate {
    window_size: Option<String>,
    discharge_time: Option<String>,
    integration_time: Option<String>,
    start_trigger: Option<String>,
    stop_trigger: Option<String>,
    leds: Option<Vec<String>>,
}

fn check(
    errors: &mut ConfigErrors,
    field: &str,
    raw: Option<&str>,
    range: &RangeInclusive<i64>,
) -> Option<i64> {
    let Some(raw) = raw else {
        errors.insert(field, "missing");
        return None;
    };
    match raw.trim().parse::<i64>() {
        Ok(value) if range.contains(&value) => Some(value),
        Ok(_) => {
            errors.insert(
                field,
                format!(
                    "invalid value {raw}, must be between {} and {}",
                    range.start(),
                    range.end()
                ),
            );
            None
        },
        Err(_) => {
            errors.insert(field, format!("invalid value {raw}, must be an integer"));
            None
        },
    }
}

/// Narrow a range-checked value.
fn narrow<T: TryFrom<i64> + Default>(value: i64) -> T {
    T::try_from(value).unwrap_or_default()
}

impl Candidate {
    fn validate(self) -> std::result::Result<DeviceConfig, ConfigErrors> {
        let mut errors = ConfigErrors::default();

        let window_size = check(
            &mut errors,
            "windowSize",
            self.window_size.as_deref(),
            &WINDOW_SIZE_RANGE,
        );
        let discharge_time = check(
            &mut errors,
            "dischargeTime",
            self.discharge_time.as_deref(),
            &DISCHARGE_TIME_RANGE,
        );
        let integration_time = check(
            &mut errors,
            "integrationTime",
            self.integration_time.as_deref(),
            &INTEGRATION_TIME_RANGE,
        );
        let start_trigger = check(
            &mut errors,
            "startTrigger",
            self.start_trigger.as_deref(),
            &START_TRIGGER_RANGE,
        );
        let stop_trigger = check(
            &mut errors,
            "stopTrigger",
            self.stop_trigger.as_deref(),
            &STOP_TRIGGER_RANGE,
        );

        let mut leds = [0u8; LED_COUNT];
        match self.leds {
            Some(values) if values.len() == LED_COUNT => {
                for (i, raw) in values.iter().enumerate() {
                    if let Some(value) =
                        check(&mut errors, &format!("leds[{i}]"), Some(raw), &LED_RANGE)
                    {
                        leds[i] = narrow(value);
                    }
                }
            },
            _ => errors.insert("leds", format!("must be an array of {LED_COUNT} values")),
        }

        match (
            window_size,
            discharge_time,
            integration_time,
            start_trigger,
            stop_trigger,
        ) {
            (Some(ws), Some(dt), Some(it), Some(st), Some(sp)) if errors.is_empty() => {
                Ok(DeviceConfig {
                    window_size: narrow(ws),
                    discharge_time: narrow(dt),
                    integration_time: narrow(it),
                    start_trigger: narrow(st),
                    stop_trigger: narrow(sp),
                    leds,
                })
            },
            _ => Err(errors),
        }
    }
}

/// Render a JSON value as text for integer parsing.
fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl DeviceConfig {
    /// Build from the tokens of a GET_CONFIG reply.
    ///
    /// Expects exactly [`CONFIG_REPLY_FIELDS`] tokens: the response code, the
    /// five timing fields, eight LED powers and the status.
    pub fn from_tokens(tokens: &[&str]) -> Result<Self> {
        if tokens.len() != CONFIG_REPLY_FIELDS {
            return Err(Error::Protocol(format!(
                "config reply has {} fields, expected {CONFIG_REPLY_FIELDS}",
                tokens.len()
            )));
        }

        let field = |i: usize| Some(tokens[i].to_string());
        Candidate {
            window_size: field(1),
            discharge_time: field(2),
            integration_time: field(3),
            start_trigger: field(4),
            stop_trigger: field(5),
            leds: Some(tokens[6..6 + LED_COUNT].iter().map(ToString::to_string).collect()),
        }
        .validate()
        .map_err(Error::InvalidConfig)
    }

    /// Build from a JSON object. Numbers and numeric strings are accepted.
    pub fn from_json(value: &Value) -> std::result::Result<Self, ConfigErrors> {
        let field = |name: &str| value.get(name).map(json_text);
        Candidate {
            window_size: field("windowSize"),
            discharge_time: field("dischargeTime"),
            integration_time: field("integrationTime"),
            start_trigger: field("startTrigger"),
            stop_trigger: field("stopTrigger"),
            leds: value
                .get("leds")
                .and_then(Value::as_array)
                .map(|leds| leds.iter().map(json_text).collect()),
        }
        .validate()
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(json).map_err(|e| Error::Config(format!("invalid JSON: {e}")))?;
        if !value.is_object() {
            return Err(Error::Config("config must be a JSON object".into()));
        }
        Self::from_json(&value).map_err(Error::InvalidConfig)
    }

    /// Check every field against its range.
    pub fn validate(&self) -> std::result::Result<(), ConfigErrors> {
        Candidate {
            window_size: Some(self.window_size.to_string()),
            discharge_time: Some(self.discharge_time.to_string()),
            integration_time: Some(self.integration_time.to_string()),
            start_trigger: Some(self.start_trigger.to_string()),
            stop_trigger: Some(self.stop_trigger.to_string()),
            leds: Some(self.leds.iter().map(ToString::to_string).collect()),
        }
        .validate()
        .map(drop)
    }

    /// JSON representation.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "windowSize": self.window_size,
            "dischargeTime": self.discharge_time,
            "integrationTime": self.integration_time,
            "startTrigger": self.start_trigger,
            "stopTrigger": self.stop_trigger,
            "leds": self.leds,
        })
    }

    /// SET_CONFIG message body.
    pub fn to_wire_body(&self) -> String {
        let mut values = vec![
            self.window_size.to_string(),
            self.discharge_time.to_string(),
            self.integration_time.to_string(),
            self.start_trigger.to_string(),
            self.stop_trigger.to_string(),
        ];
        values.extend(self.leds.iter().map(ToString::to_string));
        CommandCode::SetConfig.body(values)
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Window size:      {}", self.window_size)?;
        writeln!(f, "Discharge time:   {} ms", self.discharge_time)?;
        writeln!(f, "Integration time: {} ms", self.integration_time)?;
        writeln!(f, "Start trigger:    {}", self.start_trigger)?;
        writeln!(f, "Stop trigger:     {}", self.stop_trigger)?;
        write!(f, "LEDs:             {:?}", self.leds)
    }
}
