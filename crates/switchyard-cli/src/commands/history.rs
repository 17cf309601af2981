use super::CliContext;

/// Print the unit's deployment ledger, oldest entry first.
pub fn show(ctx: &CliContext, unit: &str, format: &str) -> anyhow::Result<()> {
    let entries = ctx.orchestrator.history(unit)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&entries)?),
        "text" => {
            if entries.is_empty() {
                println!("no ledger entries for unit {unit}");
                return Ok(());
            }
            for entry in entries {
                let from = entry
                    .from
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:>5}  {}  {:>21} -> {:<21}  {}  {}",
                    entry.seq, entry.timestamp, from, entry.to, entry.rollout_id, entry.detail
                );
            }
        }
        other => anyhow::bail!("unknown format: {other} (expected text or json)"),
    }
    Ok(())
}
