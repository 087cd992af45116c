use std::path::PathBuf;

use rpl_core::{
    evaluate_gate, BuildId, DeployStage, GateDecision, RoutingTable, RunContext, RunId, RunRecord, RunState,
    StageDef, StageOutcome, StageStatus,
};

fn context(branch: &str) -> RunContext {
    RunContext {
        run_id: RunId::from_str("run-1"),
        project_id: "shop".into(),
        branch: branch.into(),
        commit_id: "abc123".into(),
        build_id: BuildId::from_str("abc123-1"),
        repository: "registry.local/shop".into(),
        source_root: PathBuf::from("."),
        started_at_ms: 0,
    }
}

#[test]
fn test_run_record_starts_pending() {
    let rec = RunRecord::new(context("dev"));
    assert_eq!(rec.state, RunState::Pending);
    assert_eq!(rec.run_id().as_str(), "run-1");
    assert!(rec.halted_at.is_none());
}

#[test]
fn test_image_ref_is_tagged_by_build_id() {
    let ctx = context("dev");
    assert_eq!(ctx.image_ref().reference(), "registry.local/shop:abc123-1");
}

#[test]
fn test_non_deploy_branches_select_no_stage() {
    let table = RoutingTable::default();
    for branch in ["main", "feature/x", "release", ""] {
        let routed = table.route(branch);
        assert_eq!(routed, None, "branch {branch:?}");
        for stage in DeployStage::CHAIN {
            let def = StageDef::conventional(stage, "shop");
            let selected = routed == Some(stage);
            assert_eq!(evaluate_gate(&def, selected, None, true), GateDecision::Skip);
        }
    }
}

#[test]
fn test_latest_stage_status_wins() {
    let mut rec = RunRecord::new(context("prod"));
    rec.stages.push(StageOutcome {
        stage: DeployStage::Prod,
        status: StageStatus::AwaitingApproval,
        detail: None,
        at_ms: 1,
    });
    rec.stages.push(StageOutcome {
        stage: DeployStage::Prod,
        status: StageStatus::Succeeded,
        detail: None,
        at_ms: 2,
    });
    assert_eq!(rec.stage_status(DeployStage::Prod), Some(StageStatus::Succeeded));
    assert_eq!(rec.stage_status(DeployStage::Dev), None);
}

#[test]
fn test_run_record_json_roundtrip_keeps_state() {
    let mut rec = RunRecord::new(context("prod"));
    rec.state = RunState::Deploying(DeployStage::Prod);
    let json = serde_json::to_string(&rec).unwrap();
    let back: RunRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back.state, RunState::Deploying(DeployStage::Prod));
}
