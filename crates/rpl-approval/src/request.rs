use rpl_core::{DeployStage, Image, RunContext};

/// Markdown approval request written to the run's worklog when a stage halts.
pub fn format_approval_request(ctx: &RunContext, stage: DeployStage, image: Option<&Image>) -> String {
    let mut s = String::new();
    s.push_str(&format!("# APPROVAL: {} -> {}\n\n", ctx.run_id, stage));
    s.push_str(&format!("**Branch:** {} @ {}\n\n", ctx.branch, ctx.commit_id));
    match image {
        Some(img) => s.push_str(&format!("**Image:** {}\n\n", img.pinned_reference())),
        None => s.push_str("**Image:** (not pushed)\n\n"),
    }
    s.push_str("## To approve\n");
    s.push_str(&format!(
        "- `rpl approve --run {} --stage {} --by <name>`\n",
        ctx.run_id, stage
    ));
    s.push_str(&format!("- then `rpl resume --run {}`\n", ctx.run_id));
    s
}
