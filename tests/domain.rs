use serde_json::json;

use cds_harvest::config::ConfigLoader;
use cds_harvest::domain::{DateRange, Selection, YearSpec};

#[test]
fn satellite_request_inputs() {
    let catalog = ConfigLoader::builtin().unwrap();
    let sensor = catalog.sensor("MERGED_EMMA").unwrap();
    let request = sensor.request_for("xco2", "2019");
    assert_eq!(request.year, YearSpec::Single("2019".to_string()));

    let inputs = request.to_inputs();
    assert_eq!(inputs["variable"], "xco2");
    assert_eq!(inputs["processing_level"], "level_3");
    assert_eq!(inputs["sensor_and_algorithm"], "merged_emma");
    assert_eq!(inputs["version"], "4_5");
    assert_eq!(inputs["year"], "2019");
    assert_eq!(inputs["format"], "zip");
    assert_eq!(inputs["month"].as_array().map(Vec::len), Some(12));
    assert!(inputs.get("day").is_none());
    assert!(inputs.get("crop_type").is_none());
}

#[test]
fn level_two_request_sends_days() {
    let catalog = ConfigLoader::builtin().unwrap();
    let request = catalog
        .sensor("iasi_metop_a_nlis")
        .unwrap()
        .request_for("co2", "2021");

    let inputs = request.to_inputs();
    assert_eq!(inputs["processing_level"], "level_2");
    assert_eq!(inputs["version"], "10_1");
    assert_eq!(inputs["day"].as_array().map(Vec::len), Some(31));
    assert_eq!(inputs["day"][0], "01");
}

#[test]
fn agroproductivity_request_inputs() {
    let content = r#"{
        "dataset": "sis-agroproductivity-indicators",
        "sensors": [{
            "name": "maize",
            "sensor": "maize",
            "style": "agroproductivity",
            "variables": "total_above_ground_production",
            "years": ["2023"],
            "days": ["10", "20", "28", "30", "31"],
            "extra": {
                "product_family": ["crop_productivity_indicators"],
                "harvest_year": "{year}"
            }
        }]
    }"#;
    let catalog = ConfigLoader::resolve_str(content).unwrap();
    let request = catalog
        .sensor("maize")
        .unwrap()
        .request_for("total_above_ground_production", "2023");

    assert_eq!(
        request.to_inputs(),
        json!({
            "variable": "total_above_ground_production",
            "crop_type": "maize",
            "year": "2023",
            "month": "all",
            "day": ["10", "20", "28", "30", "31"],
            "format": "zip",
            "product_family": ["crop_productivity_indicators"],
            "harvest_year": "2023"
        })
    );
}

#[test]
fn date_range_uses_selection_bounds() {
    let months = Selection::Values(vec!["03".to_string(), "06".to_string()]);
    let days = Selection::Values(vec!["10".to_string(), "31".to_string()]);
    let range = DateRange::for_year("2019", &months, Some(&days)).unwrap();
    assert_eq!(range.start, "2019-03-10");
    assert_eq!(range.end, "2019-06-30");

    let leap = DateRange::for_year(
        "2020",
        &Selection::Values(vec!["02".to_string()]),
        Some(&Selection::All),
    )
    .unwrap();
    assert_eq!(leap.end, "2020-02-29");
}
