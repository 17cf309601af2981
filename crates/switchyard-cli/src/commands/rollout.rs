use switchyard_core::{Rollout, RolloutState};
use switchyard_state::StateStore;

use super::CliContext;

/// Start a rollout and wait for its terminal state.
pub async fn start(ctx: &CliContext, unit: &str, artifact: &str, size: u32) -> anyhow::Result<()> {
    let rollout_id = ctx.orchestrator.start(unit, artifact, size).await?;
    println!("{rollout_id}");

    let done = ctx.orchestrator.wait_terminal(&rollout_id).await?;
    print_rollout(&done, &ctx.store)?;

    if done.state != RolloutState::Complete {
        anyhow::bail!(
            "rollout {rollout_id} ended in {} ({})",
            done.state,
            done.failure_reason
                .map(|r| format!("{r:?}"))
                .unwrap_or_else(|| "no failure reason".to_string())
        );
    }
    Ok(())
}

pub fn status(ctx: &CliContext, rollout_id: &str) -> anyhow::Result<()> {
    let rollout = ctx.orchestrator.status(rollout_id)?;
    print_rollout(&rollout, &ctx.store)
}

pub async fn cancel(ctx: &CliContext, rollout_id: &str) -> anyhow::Result<()> {
    ctx.orchestrator.cancel(rollout_id).await?;
    println!("cancellation requested for {rollout_id}");
    Ok(())
}

fn print_rollout(rollout: &Rollout, store: &StateStore) -> anyhow::Result<()> {
    println!("rollout:  {}", rollout.id);
    println!("unit:     {}", rollout.unit_id);
    println!("artifact: {}", rollout.artifact_ref);
    println!("state:    {}", rollout.state);
    println!("split:    {:.0}%", rollout.traffic_split * 100.0);
    println!("attempts: {}", rollout.attempts);
    if let Some(reason) = rollout.failure_reason {
        println!("failure:  {reason:?}");
    }
    if let Some(group_id) = &rollout.candidate_group_id {
        if let Some(group) = store.get_group(&rollout.unit_id, group_id)? {
            println!("candidate group {group_id}:");
            for target in &group.targets {
                println!(
                    "  {}  {}  {:?}",
                    target.id, target.address, target.health
                );
            }
        }
    }
    Ok(())
}
