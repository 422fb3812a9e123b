#![forbid(unsafe_code)]

use std::path::PathBuf;

use grove::{
    Collection, CollectionError, DType, DataFrame, FloatTarget, GroveConfig, KeySpec, MergeError,
    ReportLedger, Scalar, ShrinkOptions, TableRef, inner_join, merge_tables,
};
use serde_json::json;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/data")
        .join(name)
}

fn sample_collection() -> Collection {
    Collection::create([
        ("items", fixture("items.csv")),
        ("categories", fixture("categories.csv")),
        ("measurements", fixture("measurements.csv")),
        ("cat_descr", fixture("category_descriptions.tsv")),
    ])
    .expect("collection")
}

fn spec(value: serde_json::Value) -> KeySpec {
    KeySpec::from_json(&value).expect("key spec")
}

fn rename(frame: &DataFrame, from: &str, to: &str) -> DataFrame {
    frame.rename_columns(&[(from, to)]).expect("rename")
}

fn with_copy(frame: &DataFrame, source: &str, name: &str) -> DataFrame {
    let column = frame.column(source).expect("source column").clone();
    frame.with_column(name, column).expect("with column")
}

#[test]
fn merge_on_shared_id_equals_chained_inner_joins() {
    let data = sample_collection();
    let names = ["items", "categories", "measurements"];

    let merged = data.merge(&names, &KeySpec::from("id")).expect("merge");
    let implicit = data.merge(&names, &KeySpec::Absent).expect("implicit");
    let single = data.merge(&["items"], &KeySpec::from("id")).expect("single");

    let items = data.get("items").expect("items");
    let chained = inner_join(
        &inner_join(items, data.get("categories").expect("categories"), &["id"], &["id"])
            .expect("first join"),
        data.get("measurements").expect("measurements"),
        &["id"],
        &["id"],
    )
    .expect("second join");

    assert_eq!(merged, chained);
    assert_eq!(merged, implicit);
    assert_eq!(&single, items);
    assert_eq!(
        merged.column_names(),
        &["id", "name", "category", "sensor", "reading"]
    );
    assert_eq!(merged.len(), 14);
}

#[test]
fn merge_with_different_key_names() {
    let mut data = sample_collection();
    let categories = rename(data.get("categories").expect("categories"), "id", "id1");
    let measurements = rename(data.get("measurements").expect("measurements"), "id", "id2");
    data.put("categories", categories.clone()).expect("put");
    data.put("measurements", measurements.clone()).expect("put");

    let merged = data
        .merge(
            &["items", "categories", "measurements"],
            &spec(json!([["id", "id1"], ["id1", "id2"]])),
        )
        .expect("merge");
    let expected = inner_join(
        &inner_join(data.get("items").expect("items"), &categories, &["id"], &["id1"])
            .expect("first"),
        &measurements,
        &["id1"],
        &["id2"],
    )
    .expect("second");
    assert_eq!(merged, expected);
    assert_eq!(
        merged.column_names(),
        &["id", "name", "id1", "category", "id2", "sensor", "reading"]
    );

    let err = data
        .merge(&["items", "categories"], &spec(json!([["id", "id_x"]])))
        .expect_err("missing key");
    assert_eq!(err.to_string(), "column 'id_x' not present in 'categories'");
    match err {
        CollectionError::Merge(MergeError::MissingColumn { column, table }) => {
            assert_eq!(column, "id_x");
            assert_eq!(table, TableRef::Named("categories".to_owned()));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn merge_with_mixed_key_shapes_reaches_back_into_the_chain() {
    let data = sample_collection();
    let merged = data
        .merge(
            &["items", "categories", "cat_descr"],
            &spec(json!(["id", ["category", "category_code"]])),
        )
        .expect("merge");
    let expected = inner_join(
        &inner_join(
            data.get("items").expect("items"),
            data.get("categories").expect("categories"),
            &["id"],
            &["id"],
        )
        .expect("first"),
        data.get("cat_descr").expect("cat_descr"),
        &["category"],
        &["category_code"],
    )
    .expect("second");
    assert_eq!(merged, expected);
    assert_eq!(merged.len(), 9);
}

#[test]
fn multi_column_keys_in_pair_and_shared_forms_agree() {
    let mut data = sample_collection();
    let items = with_copy(data.get("items").expect("items"), "id", "id2");
    let categories = with_copy(data.get("categories").expect("categories"), "id", "id2");
    let measurements = rename(data.get("measurements").expect("measurements"), "id", "id_x");
    data.put("items", items.clone()).expect("put");
    data.put("categories", categories.clone()).expect("put");
    data.put("measurements", measurements.clone()).expect("put");
    let names = ["items", "categories", "measurements"];

    let merged = data
        .merge(&names, &spec(json!([[["id", "id2"], ["id", "id2"]], ["id2", "id_x"]])))
        .expect("pair form");
    let common = data
        .merge(&names, &spec(json!([[["id", "id2"]], ["id2", "id_x"]])))
        .expect("shared form");
    let expected = inner_join(
        &inner_join(&items, &categories, &["id", "id2"], &["id", "id2"]).expect("first"),
        &measurements,
        &["id2"],
        &["id_x"],
    )
    .expect("second");

    assert_eq!(merged, expected);
    assert_eq!(common, merged);
}

#[test]
fn free_standing_merge_reports_positions() {
    let data = sample_collection();
    let ids = data
        .get("items")
        .expect("items")
        .select_columns(&["id"])
        .expect("select");
    let categories = data.get("categories").expect("categories").head(4).expect("head");
    let descr = data.get("cat_descr").expect("cat_descr").clone();
    let on = spec(json!(["id", ["category", "category_code"]]));

    let merged = merge_tables(&[&ids, &categories, &descr], &on).expect("merge");
    assert_eq!(merged.len(), 4);
    assert_eq!(
        merged.column_names(),
        &["id", "category", "category_code", "description"]
    );

    let err = merge_tables(&[&ids, &categories], &spec(json!([["id", "id_x"]])))
        .expect_err("missing");
    assert_eq!(err.to_string(), "column 'id_x' not present in table 1");
}

#[test]
fn mismatched_step_count_fails_before_joining() {
    let data = sample_collection();
    let err = data
        .merge(&["items", "categories"], &KeySpec::steps(["id", "id"]))
        .expect_err("too many steps");
    assert!(matches!(err, CollectionError::Merge(MergeError::KeySpec(_))));
}

#[test]
fn merge_of_unknown_names_lists_them_all() {
    let data = sample_collection();
    let err = data
        .merge(&["items", "x", "y"], &KeySpec::Absent)
        .expect_err("unknown");
    match err {
        CollectionError::NotFound { names } => assert_eq!(names, vec!["x", "y"]),
        other => panic!("unexpected error: {other}"),
    }
}

fn numbers() -> DataFrame {
    let integers = [512_941_i64, 3, 999_999, 70_000, 1, 0, 15, 480_000, 2, 77];
    DataFrame::from_dict(vec![
        ("integers", integers.iter().copied().map(Scalar::Int64).collect()),
        (
            "negated",
            integers.iter().map(|v| Scalar::Int64(-v)).collect(),
        ),
        (
            "floats",
            integers
                .iter()
                .map(|v| Scalar::Float64(*v as f64 * 1.5))
                .collect(),
        ),
        ("binaries", vec![Scalar::Int64(0); integers.len()]),
    ])
    .expect("frame")
}

#[test]
fn shrinking_a_collection_narrows_every_table() {
    let mut data = Collection::create([("numbers", numbers())]).expect("collection");
    let before = data.get("numbers").expect("numbers").memory_usage_bytes();
    data.shrink_dtypes(ShrinkOptions::default()).expect("shrink");

    let shrunk = data.get("numbers").expect("numbers");
    assert_eq!(
        shrunk.dtypes(),
        vec![
            ("integers", DType::UInt32),
            ("negated", DType::Int32),
            ("floats", DType::Float32),
            ("binaries", DType::UInt8),
        ]
    );
    assert!(shrunk.memory_usage_bytes() < before);
    assert!(shrunk.semantic_eq(&numbers()));
}

#[test]
fn shrink_can_keep_double_precision() {
    let mut data = Collection::create([("numbers", numbers())]).expect("collection");
    data.shrink_dtypes(ShrinkOptions {
        float_target: FloatTarget::Float64,
    })
    .expect("shrink");
    assert_eq!(
        data.get("numbers")
            .expect("numbers")
            .column("floats")
            .expect("floats")
            .dtype(),
        DType::Float64
    );
}

#[test]
fn sanity_check_runs_over_every_table() {
    let mut data = sample_collection();
    let mut ledger = ReportLedger::new();
    let reports = data.sanity_check(&Default::default(), &mut ledger);
    assert_eq!(reports.len(), 4);
    assert!(reports.iter().all(|report| report.passed()));
    assert!(ledger.is_empty());

    let gappy = DataFrame::from_dict(vec![
        ("id", vec![Scalar::Int64(1), Scalar::Int64(2)]),
        ("code", vec![Scalar::from("10"), Scalar::from("20")]),
    ])
    .expect("frame");
    data.put("gappy", gappy).expect("put");
    let reports = data.sanity_check(&Default::default(), &mut ledger);
    let failed: Vec<&str> = reports
        .iter()
        .filter(|report| !report.passed())
        .map(|report| report.table.as_str())
        .collect();
    assert_eq!(failed, vec!["gappy"]);
    assert_eq!(ledger.warnings().count(), 1);
}

#[test]
fn config_options_drive_collection_operations() {
    let config = GroveConfig::from_json_str(
        r#"{
            "merge": {"execution": {"use_arena": false}},
            "shrink": {"float_target": "float64"},
            "sanity": {"check_numeric_text": false},
            "info": {"memory_usage": false}
        }"#,
    )
    .expect("config");
    let mut data = sample_collection();

    let merged = data
        .merge_with_options(&["items", "categories"], &KeySpec::from("id"), &config.merge)
        .expect("merge");
    assert_eq!(
        merged,
        data.merge(&["items", "categories"], &KeySpec::from("id"))
            .expect("default merge")
    );

    data.shrink_dtypes(config.shrink).expect("shrink");
    assert_eq!(
        data.get("measurements")
            .expect("measurements")
            .column("reading")
            .expect("reading")
            .dtype(),
        DType::Float64
    );

    let mut ledger = ReportLedger::new();
    let text = data.info(config.info, &mut ledger);
    assert!(!text.contains("Memory usage"));
    assert!(data.sanity_check(&config.sanity, &mut ledger).iter().all(|r| r.passed()));
}
