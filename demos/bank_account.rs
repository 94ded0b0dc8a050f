//! Bank-account walkthrough: open accounts, move money, query balances
//! as of a past date and run an interest command over every open account.
//!
//! Run with: `cargo run --example bank_account`
//!
//! Set `RUST_LOG=streamfold_es=debug` to see appends, replays and step
//! transitions.

#[path = "../tests/support/bank.rs"]
mod bank;

use std::sync::Arc;

use chrono::{Duration, Utc};
use streamfold_es::{BroadcastDispatcher, EventContext};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let dir = tempfile::tempdir()?;
    let notifications = BroadcastDispatcher::new(64);
    let mut rx = notifications.subscribe();

    let store = bank::builder()
        .base_dir(dir.path())
        .notifier(Arc::new(notifications))
        .open()?;

    bank::open_account(&store, "A-100", "ada").await?;
    bank::open_account(&store, "A-200", "grace").await?;
    bank::deposit(&store, "A-100", 10_000).await?;
    bank::deposit(&store, "A-200", 2_500).await?;

    match bank::withdraw(&store, "A-200", 5_000).await {
        Err(e) => println!("withdrawal refused: {e}"),
        Ok(seq) => println!("withdrawal committed at {seq}"),
    }
    bank::set_overdraft_limit(&store, "A-200", 5_000).await?;
    bank::withdraw(&store, "A-200", 5_000).await?;

    let last_month = Utc::now() - Duration::days(30);
    bank::deposit_with(
        &store,
        "A-100",
        500,
        &EventContext::default()
            .with_effective_date(last_month)
            .with_commentary("late-posted salary"),
    )
    .await?;

    let as_of = Utc::now() - Duration::days(1);
    for key in ["A-100", "A-200"] {
        let now = store.process::<bank::Balance>(bank::account(key), None).await?;
        let then = store
            .process::<bank::Balance>(bank::account(key), Some(as_of))
            .await?;
        println!(
            "{key}: balance {} (seq {}), as of yesterday {}",
            now.as_ref().map_or(0, |s| s.state.current_balance),
            now.as_ref().map_or(0, |s| s.current_sequence_number),
            then.map_or(0, |s| s.state.current_balance),
        );
    }

    let run = bank::accrue_interest(&store, 125).await?;
    println!(
        "interest run {}: {:?} accrued, {:?} failed, {:?} unrecorded",
        run.command.instance_id, run.accrued, run.failed, run.unrecorded
    );
    for step in store.command(run.command).steps().await? {
        println!(
            "  step {} -> {:?} ({})",
            step.step_name,
            step.status,
            step.result_text.unwrap_or_default()
        );
    }

    let mut count = 0;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    println!("{count} notifications published");
    Ok(())
}
