use rpl_approval::{ApprovalGate, ApprovalRecord, FileApprovals};
use rpl_core::{DeployStage, RunId};

#[tokio::test]
async fn file_approvals_persist_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let run = RunId::from_str("run-42");

    let writer = FileApprovals::new(dir.path());
    assert!(!writer.is_approved(DeployStage::Staging, &run).await.unwrap());
    writer
        .record(ApprovalRecord::now(DeployStage::Staging, run.clone(), "bob"))
        .await
        .unwrap();

    let reader = FileApprovals::new(dir.path());
    let rec = reader.approval(DeployStage::Staging, &run).await.unwrap().unwrap();
    assert_eq!(rec.approved_by, "bob");
    assert!(!reader.is_approved(DeployStage::Prod, &run).await.unwrap());
}

#[tokio::test]
async fn misplaced_record_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let gate = FileApprovals::new(dir.path());
    let other = RunId::from_str("run-a");
    gate.record(ApprovalRecord::now(DeployStage::Prod, other, "carol")).await.unwrap();

    let target = RunId::from_str("run-b");
    std::fs::create_dir_all(dir.path().join("run-b")).unwrap();
    std::fs::copy(dir.path().join("run-a/prod.json"), dir.path().join("run-b/prod.json")).unwrap();
    assert!(!gate.is_approved(DeployStage::Prod, &target).await.unwrap());
}
