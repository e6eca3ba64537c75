use hplsweep_ingest::{parse_output, ParsedResult};

const SAMPLE: &str = include_str!("data/single_run.out");

#[test]
fn reparsing_is_byte_identical() {
    let first = serde_yaml::to_string(&parse_output(SAMPLE)).unwrap();
    let second = serde_yaml::to_string(&parse_output(SAMPLE)).unwrap();

    assert_eq!(first, second);
}

#[test]
fn serialized_result_reads_back() {
    let result = parse_output(SAMPLE);
    let text = serde_yaml::to_string(&result).unwrap();
    let restored: ParsedResult = serde_yaml::from_str(&text).unwrap();

    assert_eq!(restored, result);
    assert!(text.contains("residual_check: PASSED"));
}
