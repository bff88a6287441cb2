//! End-to-end runs over local product storage.
//!
//! Each test seeds a temporary root with a farm registry, a weather snapshot,
//! and the advisory catalogs, then drives a full pipeline run and inspects
//! the partitioned output, the delivered CSV, and the error log.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;

use dcas_core::catalog::{
    Crop, CropStageType, GddConfig, GddMatrixEntry, GrowthStage, MessagePriority,
    MessageTemplate, Parameter, Rule, RunCatalogs,
};
use dcas_core::config::PipelineSettings;
use dcas_core::keys::{daily_epochs, date_to_epoch};
use dcas_core::partition::OutputPartition;
use dcas_core::storage::{LocalFsBackend, StorageBackend};
use dcas_pipeline::error_log::ErrorLog;
use dcas_pipeline::farm::{write_registry, FarmRecord};
use dcas_pipeline::output::read_output;
use dcas_pipeline::weather::{GridWeather, WeatherTable};
use dcas_pipeline::{CancelToken, DcasPipeline, PipelineEnv, RequestStatus};

const PLANTING: &str = "2025-01-09";
const PROCESSING: &str = "2025-03-04";

fn date(s: &str) -> NaiveDate {
    s.parse().expect("date literal")
}

fn catalogs() -> RunCatalogs {
    RunCatalogs {
        crops: vec![Crop {
            id: 3,
            name: "Cassava".into(),
        }],
        crop_stage_types: vec![CropStageType {
            id: 1,
            name: "Early".into(),
        }],
        growth_stages: vec![
            GrowthStage {
                id: 1,
                label: "Emergence".into(),
            },
            GrowthStage {
                id: 2,
                label: "Vegetative".into(),
            },
        ],
        gdd_configs: vec![GddConfig {
            crop_id: 3,
            crop_stage_type_id: 1,
            config_id: 1,
            base_temperature: 12.0,
            cap_temperature: 35.0,
        }],
        gdd_matrix: vec![
            GddMatrixEntry {
                crop_id: 3,
                crop_stage_type_id: 1,
                config_id: 1,
                growth_stage_id: 1,
                gdd_threshold: 100.0,
            },
            GddMatrixEntry {
                crop_id: 3,
                crop_stage_type_id: 1,
                config_id: 1,
                growth_stage_id: 2,
                gdd_threshold: 800.0,
            },
        ],
        rules: vec![
            Rule {
                config_id: 1,
                crop_id: 3,
                crop_stage_type_id: 1,
                crop_growth_stage_id: 2,
                parameter: Parameter::Humidity,
                min_range: 0.0,
                max_range: 100.0,
                code: 101,
            },
            Rule {
                config_id: 1,
                crop_id: 3,
                crop_stage_type_id: 1,
                crop_growth_stage_id: 2,
                parameter: Parameter::Temperature,
                min_range: 20.0,
                max_range: 30.0,
                code: 102,
            },
        ],
        priorities: vec![
            MessagePriority {
                config_id: 1,
                code: 101,
                priority: 9,
            },
            MessagePriority {
                config_id: 1,
                code: 102,
                priority: 5,
            },
        ],
        templates: vec![
            MessageTemplate {
                code: 101,
                template_en: "Scout for pests this week.".into(),
                template_sw: Some("Kagua wadudu wiki hii.".into()),
            },
            MessageTemplate {
                code: 102,
                template_en: "Conditions favor weeding.".into(),
                template_sw: None,
            },
        ],
        country_configs: HashMap::from([("KEN".to_string(), 1)]),
    }
}

fn farm(farm_id: u64, grid_id: u64) -> FarmRecord {
    FarmRecord {
        farm_id,
        farm_unique_id: format!("F-{farm_id}"),
        registry_id: 1,
        grid_id,
        grid_unique_id: Some(format!("G-{grid_id}")),
        crop_id: 3,
        crop_stage_type_id: 1,
        planting_date: date(PLANTING),
        iso_a3: "KEN".into(),
        county: Some("Nakuru".into()),
        subcounty: Some("Njoro".into()),
        ward: None,
        preferred_language: Some("en".into()),
        longitude: Some(36.0712),
        latitude: Some(-0.3031),
    }
}

fn weather_for(grids: &[u64]) -> WeatherTable {
    let epoch_list = daily_epochs(date(PLANTING), date(PROCESSING));
    let n = epoch_list.len();
    let grid = GridWeather {
        max_temperature: vec![Some(30.0); n],
        min_temperature: vec![Some(20.0); n],
        total_rainfall: vec![Some(2.0); n],
        temperature: Some(25.0),
        humidity: Some(70.0),
        p_pet: Some(0.8),
    };
    WeatherTable {
        epoch_list,
        grids: grids.iter().map(|id| (*id, grid.clone())).collect(),
    }
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        grid_crop_num_partitions: 2,
        store_csv_to_minio: true,
        override_request_date: Some(date(PROCESSING)),
        farm_registries: vec!["inputs/registry.parquet".to_string()],
        ..PipelineSettings::default()
    }
}

async fn seed(root: &Path, farms: &[FarmRecord], weather: &WeatherTable) -> Arc<LocalFsBackend> {
    let backend = Arc::new(LocalFsBackend::new(root));
    backend
        .put(
            "inputs/registry.parquet",
            write_registry(farms).expect("registry"),
            "application/vnd.apache.parquet",
        )
        .await
        .expect("seed registry");
    backend
        .put(
            "inputs/weather.parquet",
            weather.to_parquet().expect("weather"),
            "application/vnd.apache.parquet",
        )
        .await
        .expect("seed weather");
    backend
}

fn pipeline(backend: Arc<LocalFsBackend>, root: &Path, settings: PipelineSettings) -> DcasPipeline {
    DcasPipeline::new(PipelineEnv {
        backend,
        catalogs: Arc::new(catalogs()),
        settings,
        weather_path: "inputs/weather.parquet".to_string(),
        products_root: Some(root.to_path_buf()),
        sftp: None,
        stage_timeout: None,
    })
}

#[tokio::test]
async fn full_run_produces_partition_csv_and_stage_resolution() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = seed(dir.path(), &[farm(1, 7)], &weather_for(&[7])).await;
    let pipeline = pipeline(Arc::clone(&backend), dir.path(), settings());

    let summary = pipeline.run(&CancelToken::new()).await.expect("run");
    assert_eq!(summary.status, RequestStatus::Completed);
    assert_eq!(summary.output_rows, 1);
    assert_eq!(summary.error_records, 0);

    // One partition for KEN on the processing date, part file present.
    let partition = OutputPartition::new("KEN", date(PROCESSING));
    assert_eq!(summary.partitions_written, vec![partition.clone()]);
    let bytes = backend
        .get(&partition.file_path(0))
        .await
        .expect("partition file");
    let records = read_output(&bytes).expect("read output");
    assert_eq!(records.len(), 1);

    // 54 accumulating days at 13 GDD resolve the vegetative stage, entered
    // the day the running sum first exceeded 100.
    let record = &records[0];
    assert_eq!(record.growth_stage_id, Some(2));
    assert_eq!(
        record.growth_stage_start_date,
        Some(date_to_epoch(date("2025-01-17")))
    );

    // Both rules fire; priority puts 101 first and selects it.
    assert_eq!(record.messages[0], Some(101));
    assert_eq!(record.messages[1], Some(102));
    assert_eq!(record.final_message, Some(101));

    // The CSV landed in the store and carries the farm and its message.
    let csv = backend
        .get("dcas_csv/DCAS_output_20250304.csv")
        .await
        .expect("csv");
    let csv = String::from_utf8(csv.to_vec()).expect("utf8");
    let mut lines = csv.lines();
    let header = lines.next().expect("header");
    assert!(header.contains("message_code"));
    assert!(header.contains("message_english"));
    let row = lines.next().expect("data row");
    assert!(row.contains("F-1"));
    assert!(row.contains("101"));
    assert!(row.contains("Scout for pests this week."));
    assert!(row.contains("Vegetative"));
    assert_eq!(lines.next(), None);
}

#[tokio::test]
async fn repeated_final_message_falls_back_and_is_logged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = seed(dir.path(), &[farm(1, 7)], &weather_for(&[7])).await;

    // Seed last week's output with final message 101 for the same key.
    let prev_date = date(PROCESSING) - chrono::Duration::days(7);
    let prev_row = dcas_pipeline::farm::FarmOutputRow {
        farm: farm(1, 7),
        crop_label: Some("Cassava_Early".into()),
        growth_stage_label: Some("Vegetative".into()),
        result: {
            let mut row = dcas_pipeline::grid_crop::GridCropRow::new(farm(1, 7).grid_crop_key(), 1);
            row.growth_stage_id = Some(2);
            row.growth_stage_start_date = Some(date_to_epoch(date("2025-01-17")));
            row.messages[0] = Some(101);
            row.final_message = Some(101);
            row
        },
        processing_date: prev_date,
    };
    dcas_pipeline::output::write_partitions(backend.as_ref(), &[prev_row])
        .await
        .expect("seed prev week");

    let pipeline = pipeline(Arc::clone(&backend), dir.path(), settings());
    let summary = pipeline.run(&CancelToken::new()).await.expect("run");
    assert_eq!(summary.status, RequestStatus::Completed);

    let partition = OutputPartition::new("KEN", date(PROCESSING));
    let records = read_output(&backend.get(&partition.file_path(0)).await.expect("file"))
        .expect("read");
    // The top candidate repeats last week, so the second is selected.
    assert_eq!(records[0].final_message, Some(102));
    assert_eq!(records[0].messages[0], Some(101));

    // The fallback is recorded in the error log.
    assert_eq!(summary.error_records, 1);
    let logs = backend
        .list(&format!("dcas_error_log/request_id={}/", summary.request_id))
        .await
        .expect("list");
    assert_eq!(logs.len(), 1);
    let log = ErrorLog::from_parquet(&backend.get(&logs[0].path).await.expect("log"))
        .expect("parse log");
    assert_eq!(log.records()[0].kind.as_str(), "FOUND_REPETITIVE");
    assert_eq!(log.records()[0].farm_id, 1);
}

#[tokio::test]
async fn grid_without_weather_goes_to_error_log_not_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Farm 2 sits on grid 99, which the weather snapshot does not cover.
    let backend = seed(dir.path(), &[farm(1, 7), farm(2, 99)], &weather_for(&[7])).await;
    let pipeline = pipeline(Arc::clone(&backend), dir.path(), settings());

    let summary = pipeline.run(&CancelToken::new()).await.expect("run");
    assert_eq!(summary.status, RequestStatus::Completed);

    // Every farm lands in exactly one place: output or error log.
    assert_eq!(summary.output_rows, 1);
    assert_eq!(summary.error_records, 1);

    let partition = OutputPartition::new("KEN", date(PROCESSING));
    let records = read_output(&backend.get(&partition.file_path(0)).await.expect("file"))
        .expect("read");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].farm_id, 1);

    let logs = backend
        .list(&format!("dcas_error_log/request_id={}/", summary.request_id))
        .await
        .expect("list");
    let log = ErrorLog::from_parquet(&backend.get(&logs[0].path).await.expect("log"))
        .expect("parse log");
    assert_eq!(log.records()[0].farm_id, 2);
    assert_eq!(log.records()[0].kind.as_str(), "PROCESSING_FAILURE");
}

#[tokio::test]
async fn cancelled_run_stops_without_writing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = seed(dir.path(), &[farm(1, 7)], &weather_for(&[7])).await;
    let pipeline = pipeline(Arc::clone(&backend), dir.path(), settings());

    let cancel = CancelToken::new();
    cancel.cancel();
    let summary = pipeline.run(&cancel).await.expect("run");

    assert_eq!(summary.status, RequestStatus::Stopped);
    assert!(summary.partitions_written.is_empty());
    assert!(backend.list("dcas_output/").await.expect("list").is_empty());
}

#[tokio::test]
async fn reruns_over_identical_inputs_are_deterministic() {
    let mut first: Option<(Vec<dcas_pipeline::output::OutputRecord>, String)> = None;
    for _ in 0..2 {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = seed(dir.path(), &[farm(1, 7), farm(2, 8)], &weather_for(&[7, 8])).await;
        let pipeline = pipeline(Arc::clone(&backend), dir.path(), settings());
        let summary = pipeline.run(&CancelToken::new()).await.expect("run");
        assert_eq!(summary.status, RequestStatus::Completed);

        let partition = OutputPartition::new("KEN", date(PROCESSING));
        let records = read_output(&backend.get(&partition.file_path(0)).await.expect("file"))
            .expect("read");
        let csv = backend
            .get("dcas_csv/DCAS_output_20250304.csv")
            .await
            .expect("csv");
        let csv = String::from_utf8(csv.to_vec()).expect("utf8");

        match &first {
            None => first = Some((records, csv)),
            Some((prev_records, prev_csv)) => {
                assert_eq!(&records, prev_records);
                assert_eq!(&csv, prev_csv);
            }
        }
    }
}

#[tokio::test]
async fn partition_counts_do_not_change_results() {
    let mut first: Option<Vec<dcas_pipeline::output::OutputRecord>> = None;
    for (farm_parts, grid_parts) in [(1, 1), (3, 2)] {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = seed(dir.path(), &[farm(1, 7), farm(2, 8)], &weather_for(&[7, 8])).await;
        let mut settings = settings();
        settings.farm_num_partitions = farm_parts;
        settings.grid_crop_num_partitions = grid_parts;
        let pipeline = pipeline(Arc::clone(&backend), dir.path(), settings);
        let summary = pipeline.run(&CancelToken::new()).await.expect("run");
        assert_eq!(summary.status, RequestStatus::Completed);
        assert_eq!(summary.output_rows, 2);

        let partition = OutputPartition::new("KEN", date(PROCESSING));
        let records = read_output(&backend.get(&partition.file_path(0)).await.expect("file"))
            .expect("read");
        match &first {
            None => first = Some(records),
            Some(prev) => assert_eq!(&records, prev),
        }
    }
}

#[tokio::test]
async fn suppression_nulls_previously_sent_codes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = seed(dir.path(), &[farm(1, 7)], &weather_for(&[7])).await;

    // Ten days ago this farm already received code 102. The date sits on no
    // weekly boundary but is inside a two-week horizon.
    let old_date = date(PROCESSING) - chrono::Duration::days(10);
    let old_row = dcas_pipeline::farm::FarmOutputRow {
        farm: farm(1, 7),
        crop_label: None,
        growth_stage_label: None,
        result: {
            let mut row = dcas_pipeline::grid_crop::GridCropRow::new(farm(1, 7).grid_crop_key(), 1);
            row.messages[0] = Some(102);
            row.final_message = Some(102);
            row
        },
        processing_date: old_date,
    };
    dcas_pipeline::output::write_partitions(backend.as_ref(), &[old_row])
        .await
        .expect("seed history");

    let mut settings = settings();
    settings.weeks_constraint = Some(2);
    let pipeline = pipeline(Arc::clone(&backend), dir.path(), settings);
    let summary = pipeline.run(&CancelToken::new()).await.expect("run");
    assert_eq!(summary.status, RequestStatus::Completed);

    let partition = OutputPartition::new("KEN", date(PROCESSING));
    let records = read_output(&backend.get(&partition.file_path(0)).await.expect("file"))
        .expect("read");
    // 102 was already sent and is nulled in place; 101 survives in slot one.
    assert_eq!(records[0].messages, [Some(101), None, None, None, None]);
    assert_eq!(records[0].final_message, Some(101));
}
