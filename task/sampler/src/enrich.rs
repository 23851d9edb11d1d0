// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sample enrichment
//!
//! Turns a raw register map into the telemetry record the back end wants:
//! energy-flow classification, power balance, battery grading, efficiency,
//! label lookups, and a quality assessment of the sample itself.
//!
//! Every derivation is optional: if an input register is missing from the
//! sample, the derived field is simply omitted.  The enricher must never
//! fail, whatever shape the sample is in.

use serde::Serialize;
use serde_json::{Map, Value};

use drv_inverter_devices::spf5000es::{fault_label, working_mode_label};
use publish_api::timestamp;

/// How much a sample can be trusted, from "nothing came back" to "every
/// monitored register present and plausible".
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataQuality {
    NoData,
    Poor,
    Questionable,
    Limited,
    Good,
    Excellent,
}

/// Grades a raw sample.  The battery voltage window (10-60 V) and SOC
/// window (0-100 %) bound what the hardware can physically report; values
/// outside them mean a misread, not a remarkable battery.
pub fn assess_quality(raw: &Map<String, Value>) -> DataQuality {
    if raw.is_empty() {
        return DataQuality::NoData;
    }

    let critical = ["battery_voltage", "battery_soc", "working_mode"];
    if critical
        .iter()
        .any(|field| raw.get(*field).map_or(true, Value::is_null))
    {
        return DataQuality::Poor;
    }

    if let Some(voltage) = number(raw, "battery_voltage") {
        if !(10.0..=60.0).contains(&voltage) {
            return DataQuality::Questionable;
        }
    }
    if let Some(soc) = number(raw, "battery_soc") {
        if !(0.0..=100.0).contains(&soc) {
            return DataQuality::Questionable;
        }
    }

    match raw.len() {
        0..=4 => DataQuality::Limited,
        5..=9 => DataQuality::Good,
        _ => DataQuality::Excellent,
    }
}

/// Builds the enriched record: the raw fields plus whatever derivations
/// their presence allows, plus collection metadata.
pub fn enrich(raw: &Map<String, Value>, collection_count: u64) -> Map<String, Value> {
    let mut out = raw.clone();

    let pv_power = number(raw, "pv_power");
    let battery_power = number(raw, "battery_power");
    let load_power = number(raw, "load_power");

    if let (Some(pv), Some(battery)) = (pv_power, battery_power) {
        let flow = if pv > 0.0 {
            if battery > 0.0 {
                "pv_to_battery_and_load"
            } else {
                "pv_to_load"
            }
        } else if battery < 0.0 {
            "battery_to_load"
        } else {
            "grid_to_load"
        };
        out.insert("energy_flow".to_string(), Value::from(flow));
    }

    if let (Some(pv), Some(battery), Some(load)) = (pv_power, battery_power, load_power) {
        out.insert(
            "power_balance".to_string(),
            Value::from(pv + battery - load),
        );
    }

    if let Some(soc) = number(raw, "battery_soc") {
        let status = if soc > 90.0 {
            "full"
        } else if soc > 50.0 {
            "good"
        } else if soc > 20.0 {
            "low"
        } else {
            "critical"
        };
        out.insert("battery_status".to_string(), Value::from(status));
    }

    if let (Some(output), Some(input)) = (
        number(raw, "ac_power_output"),
        number(raw, "ac_power_input"),
    ) {
        if input > 0.0 {
            let efficiency = round2(output / input * 100.0);
            out.insert("system_efficiency".to_string(), Value::from(efficiency));
        }
    }

    if let Some(mode) = integer(raw, "working_mode") {
        out.insert(
            "working_mode_description".to_string(),
            Value::from(working_mode_label(mode)),
        );
    }

    if let Some(code) = integer(raw, "fault_code") {
        out.insert(
            "fault_description".to_string(),
            Value::from(fault_label(code)),
        );
    }

    let mut metadata = Map::new();
    metadata.insert("collection_time".to_string(), Value::from(timestamp()));
    metadata.insert(
        "collection_count".to_string(),
        Value::from(collection_count),
    );
    metadata.insert(
        "data_quality".to_string(),
        Value::from(quality_name(assess_quality(raw))),
    );
    out.insert("collection_metadata".to_string(), Value::Object(metadata));

    out
}

fn quality_name(quality: DataQuality) -> &'static str {
    match quality {
        DataQuality::NoData => "no_data",
        DataQuality::Poor => "poor",
        DataQuality::Questionable => "questionable",
        DataQuality::Limited => "limited",
        DataQuality::Good => "good",
        DataQuality::Excellent => "excellent",
    }
}

fn number(raw: &Map<String, Value>, key: &str) -> Option<f64> {
    raw.get(key)?.as_f64()
}

fn integer(raw: &Map<String, Value>, key: &str) -> Option<i64> {
    raw.get(key)?.as_i64()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn raw(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn pv_with_discharging_battery_reads_as_pv_to_load() {
        let enriched = enrich(
            &raw(json!({
                "pv_power": 1200, "battery_power": -400, "load_power": 900,
                "battery_soc": 55, "ac_power_input": 0, "ac_power_output": 800
            })),
            7,
        );

        // pv_power > 0 wins the branch even though the battery discharges.
        assert_eq!(enriched["energy_flow"], json!("pv_to_load"));
        assert_eq!(enriched["power_balance"], json!(-100.0));
        assert_eq!(enriched["battery_status"], json!("good"));
        assert!(enriched.get("system_efficiency").is_none());
        assert_eq!(enriched["collection_metadata"]["collection_count"], json!(7));
    }

    #[test]
    fn energy_flow_covers_all_branches() {
        let flow = |pv: f64, battery: f64| {
            enrich(
                &raw(json!({"pv_power": pv, "battery_power": battery})),
                0,
            )["energy_flow"]
                .clone()
        };

        assert_eq!(flow(500.0, 200.0), json!("pv_to_battery_and_load"));
        assert_eq!(flow(500.0, 0.0), json!("pv_to_load"));
        assert_eq!(flow(0.0, -300.0), json!("battery_to_load"));
        assert_eq!(flow(0.0, 0.0), json!("grid_to_load"));
        assert_eq!(flow(0.0, 250.0), json!("grid_to_load"));
    }

    #[test]
    fn battery_status_grades_by_soc() {
        let status = |soc: i64| {
            enrich(&raw(json!({ "battery_soc": soc })), 0)["battery_status"].clone()
        };
        assert_eq!(status(95), json!("full"));
        assert_eq!(status(90), json!("good"));
        assert_eq!(status(51), json!("good"));
        assert_eq!(status(50), json!("low"));
        assert_eq!(status(21), json!("low"));
        assert_eq!(status(20), json!("critical"));
        assert_eq!(status(0), json!("critical"));
    }

    #[test]
    fn efficiency_needs_positive_input_power() {
        let enriched = enrich(
            &raw(json!({"ac_power_output": 856, "ac_power_input": 998})),
            0,
        );
        assert_eq!(enriched["system_efficiency"], json!(85.77));

        let enriched = enrich(
            &raw(json!({"ac_power_output": 800, "ac_power_input": 0})),
            0,
        );
        assert!(enriched.get("system_efficiency").is_none());

        let enriched = enrich(&raw(json!({"ac_power_output": 800})), 0);
        assert!(enriched.get("system_efficiency").is_none());
    }

    #[test]
    fn labels_are_attached_when_codes_are_present() {
        let enriched = enrich(&raw(json!({"working_mode": 3, "fault_code": 2})), 0);
        assert_eq!(enriched["working_mode_description"], json!("Battery Mode"));
        assert_eq!(enriched["fault_description"], json!("Over Temperature"));

        let enriched = enrich(&raw(json!({"battery_soc": 10})), 0);
        assert!(enriched.get("working_mode_description").is_none());
        assert!(enriched.get("fault_description").is_none());
    }

    #[test]
    fn absent_inputs_omit_derivations() {
        let enriched = enrich(&raw(json!({"pv_power": 1200})), 0);
        assert!(enriched.get("energy_flow").is_none());
        assert!(enriched.get("power_balance").is_none());
        assert!(enriched.get("battery_status").is_none());
        // Metadata is always present.
        assert_eq!(
            enriched["collection_metadata"]["data_quality"],
            json!("poor")
        );
        assert!(enriched["collection_metadata"]["collection_time"]
            .as_str()
            .unwrap()
            .ends_with('Z'));
    }

    #[test]
    fn quality_grades() {
        assert_eq!(assess_quality(&Map::new()), DataQuality::NoData);

        // A sample missing any critical field is poor however big it is.
        assert_eq!(
            assess_quality(&raw(json!({"pv_power": 1, "battery_soc": 2, "working_mode": 3}))),
            DataQuality::Poor
        );

        // Implausible readings are flagged before completeness counts.
        assert_eq!(
            assess_quality(&raw(json!({
                "battery_voltage": 70, "battery_soc": 55, "working_mode": 3
            }))),
            DataQuality::Questionable
        );
        assert_eq!(
            assess_quality(&raw(json!({
                "battery_voltage": 48, "battery_soc": 150, "working_mode": 3
            }))),
            DataQuality::Questionable
        );

        let base = json!({
            "battery_voltage": 48, "battery_soc": 55, "working_mode": 3
        });
        assert_eq!(assess_quality(&raw(base.clone())), DataQuality::Limited);

        let mut five = raw(base.clone());
        five.insert("pv_power".to_string(), json!(100));
        five.insert("load_power".to_string(), json!(100));
        assert_eq!(assess_quality(&five), DataQuality::Good);

        let mut eleven = five.clone();
        for i in 0..6 {
            eleven.insert(format!("extra_{}", i), json!(i));
        }
        assert_eq!(assess_quality(&eleven), DataQuality::Excellent);
    }

    proptest! {
        // Whatever subset of fields shows up, enrichment must not panic,
        // and a derivation appears only when its inputs do.
        #[test]
        fn enrichment_is_total(
            pv in proptest::option::of(-5000.0f64..5000.0),
            battery in proptest::option::of(-5000.0f64..5000.0),
            load in proptest::option::of(0.0f64..5000.0),
            soc in proptest::option::of(-10i64..150),
            mode in proptest::option::of(0i64..12),
        ) {
            let mut sample = Map::new();
            if let Some(v) = pv { sample.insert("pv_power".to_string(), json!(v)); }
            if let Some(v) = battery { sample.insert("battery_power".to_string(), json!(v)); }
            if let Some(v) = load { sample.insert("load_power".to_string(), json!(v)); }
            if let Some(v) = soc { sample.insert("battery_soc".to_string(), json!(v)); }
            if let Some(v) = mode { sample.insert("working_mode".to_string(), json!(v)); }

            let enriched = enrich(&sample, 0);

            prop_assert_eq!(
                enriched.contains_key("energy_flow"),
                pv.is_some() && battery.is_some()
            );
            prop_assert_eq!(
                enriched.contains_key("power_balance"),
                pv.is_some() && battery.is_some() && load.is_some()
            );
            prop_assert_eq!(enriched.contains_key("battery_status"), soc.is_some());
            prop_assert_eq!(
                enriched.contains_key("working_mode_description"),
                mode.is_some()
            );
            prop_assert!(enriched.contains_key("collection_metadata"));
        }
    }
}
