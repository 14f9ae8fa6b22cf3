//! Decoding raw device status into scaled, unit-tagged readings.

use crate::catalog::Catalog;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw `dps` object as reported by the device: data-point key to value.
pub type RawStatus = serde_json::Map<String, serde_json::Value>;

/// Current UTC time in RFC 3339 format, captured once per poll iteration.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A single scaled measurement with its unit label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointValue {
    pub value: f64,
    pub units: String,
}

/// One complete decoded poll.
///
/// Serializes to the aggregate telemetry payload:
///
/// ```text
/// {"Time": "2024-03-01T10:15:30.123456Z",
///  "data": {"voltage": {"value": 246.7, "units": "V"}, ...}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Capture time, taken before the device exchange
    #[serde(rename = "Time")]
    pub time: String,

    /// Decoded measurements keyed by name
    pub data: BTreeMap<String, PointValue>,
}

impl Reading {
    /// Decode a raw status object against the catalog.
    ///
    /// Keys without a catalog entry and cataloged keys with a missing or
    /// non-numeric value are skipped; decoding itself never fails. The
    /// output is deterministic for a given input: map order is sorted and
    /// scaling is rounded to the scale factor's implied precision.
    pub fn decode(time: String, raw: &RawStatus, catalog: &Catalog) -> Self {
        let mut data = BTreeMap::new();

        for (key, def) in catalog.iter() {
            let Some(value) = raw.get(key).and_then(serde_json::Value::as_f64) else {
                continue;
            };
            data.insert(
                def.name.clone(),
                PointValue {
                    value: scale_value(value, def.scale),
                    units: def.units.clone(),
                },
            );
        }

        Self { time, data }
    }

    /// Flat projection: measurement name to scaled value.
    pub fn flat(&self) -> BTreeMap<String, f64> {
        self.data
            .iter()
            .map(|(name, point)| (name.clone(), point.value))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Apply a scale factor and round to its implied decimal places, so a raw
/// 2467 at scale 0.1 becomes exactly 246.7 instead of a long float tail.
fn scale_value(raw: f64, scale: f64) -> f64 {
    let precision = 10f64.powi(implied_decimals(scale) as i32);
    (raw * scale * precision).round() / precision
}

/// Fractional digits a scale factor introduces (0.01 yields 2).
fn implied_decimals(scale: f64) -> u32 {
    let mut s = scale.abs();
    let mut decimals = 0;
    while decimals < 9 && (s - s.round()).abs() > 1e-9 {
        s *= 10.0;
        decimals += 1;
    }
    decimals
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawStatus {
        value.as_object().expect("raw status fixture").clone()
    }

    #[test]
    fn test_decode_voltage_example() {
        let catalog = Catalog::energy_meter();
        let status = raw(json!({"112": 2467}));

        let reading = Reading::decode("t0".to_string(), &status, &catalog);

        assert_eq!(reading.data.len(), 1);
        let point = &reading.data["voltage"];
        assert_eq!(point.value, 246.7);
        assert_eq!(point.units, "V");
    }

    #[test]
    fn test_decode_skips_unknown_and_non_numeric() {
        let catalog = Catalog::energy_meter();
        let status = raw(json!({
            "112": 2467,
            "999": 5,            // not in the catalog
            "113": "FWD",        // cataloged key, non-numeric value
        }));

        let reading = Reading::decode("t0".to_string(), &status, &catalog);

        assert_eq!(reading.data.len(), 1);
        assert!(reading.data.contains_key("voltage"));
        assert!(!reading.data.contains_key("current_a"));
    }

    #[test]
    fn test_decode_empty_status() {
        let catalog = Catalog::energy_meter();
        let status = RawStatus::new();

        let reading = Reading::decode("t0".to_string(), &status, &catalog);
        assert!(reading.is_empty());
    }

    #[test]
    fn test_decode_is_deterministic() {
        let catalog = Catalog::energy_meter();
        let status = raw(json!({"101": 55, "112": 2467, "111": 5002}));

        let a = Reading::decode("t0".to_string(), &status, &catalog);
        let b = Reading::decode("t0".to_string(), &status, &catalog);

        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_wire_shape() {
        let catalog = Catalog::energy_meter();
        let status = raw(json!({"112": 2467}));

        let reading = Reading::decode("2024-03-01T10:15:30.123456Z".to_string(), &status, &catalog);
        let wire = serde_json::to_value(&reading).unwrap();

        assert_eq!(
            wire,
            json!({
                "Time": "2024-03-01T10:15:30.123456Z",
                "data": {"voltage": {"value": 246.7, "units": "V"}}
            })
        );

        // No float tail artifacts on the wire
        let text = serde_json::to_string(&reading).unwrap();
        assert!(text.contains("246.7"));
        assert!(!text.contains("246.70000"));
    }

    #[test]
    fn test_wire_roundtrip() {
        let text = r#"{"Time":"t0","data":{"frequency":{"value":50.02,"units":"Hz"}}}"#;
        let reading: Reading = serde_json::from_str(text).unwrap();

        assert_eq!(reading.time, "t0");
        assert_eq!(reading.data["frequency"].value, 50.02);
        assert_eq!(serde_json::to_string(&reading).unwrap(), text);
    }

    #[test]
    fn test_flat_projection() {
        let catalog = Catalog::energy_meter();
        let status = raw(json!({"101": 55, "112": 2467}));

        let reading = Reading::decode("t0".to_string(), &status, &catalog);
        let flat = reading.flat();

        assert_eq!(flat.len(), 2);
        assert_eq!(flat["power_a"], 5.5);
        assert_eq!(flat["voltage"], 246.7);
    }

    #[test]
    fn test_implied_decimals() {
        assert_eq!(implied_decimals(1.0), 0);
        assert_eq!(implied_decimals(0.1), 1);
        assert_eq!(implied_decimals(0.01), 2);
        assert_eq!(implied_decimals(0.001), 3);
        assert_eq!(implied_decimals(10.0), 0);
    }

    #[test]
    fn test_scale_value_precision() {
        // 2467 * 0.1 is 246.70000000000002 in plain f64 arithmetic
        assert_eq!(scale_value(2467.0, 0.1), 246.7);
        assert_eq!(scale_value(123.0, 0.001), 0.123);
        assert_eq!(scale_value(5002.0, 0.01), 50.02);
        assert_eq!(scale_value(42.0, 1.0), 42.0);
    }

    #[test]
    fn test_timestamp_format() {
        let ts = timestamp_now();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }
}
