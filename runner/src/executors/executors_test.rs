use super::{parse_job_id, JobState, JobStatus};

#[test]
pub fn queue_lines_are_parsed() {
    let state = JobState::parse("4711|RUNNING|None|spot|spot-node-3|output-batch-12").unwrap();

    assert_eq!(state.job_id, "4711");
    assert_eq!(state.status, JobStatus::Running);
    assert_eq!(state.reason, "None");
    assert_eq!(state.partition, "spot");
    assert_eq!(state.nodes, "spot-node-3");
    assert_eq!(state.name, "output-batch-12");
}

#[test]
pub fn job_names_may_contain_the_separator() {
    let state = JobState::parse("12|PENDING|NodeFail|compute||odd|name").unwrap();

    assert_eq!(state.status, JobStatus::Pending);
    assert_eq!(state.nodes, "");
    assert_eq!(state.name, "odd|name");
}

#[test]
pub fn malformed_lines_are_skipped() {
    assert!(JobState::parse("").is_none());
    assert!(JobState::parse("12|RUNNING").is_none());
}

#[test]
pub fn unknown_states_are_kept() {
    assert_eq!(
        "reQUEUED".parse::<JobStatus>().unwrap(),
        JobStatus::Other("REQUEUED".to_string())
    );
    assert_eq!(JobStatus::NodeFail.to_string(), "NODE_FAIL");
}

#[test]
pub fn submitted_job_ids_are_extracted() {
    assert_eq!(
        parse_job_id("Submitted batch job 1234\n"),
        Some("1234".to_string())
    );
    assert_eq!(parse_job_id("sbatch: error: invalid partition"), None);
}
