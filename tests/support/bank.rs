//! Bank-account domain shared by the integration tests and the demo.
//!
//! Accounts are event streams under `bank/account/<key>`. Every write
//! validates against the balance projection first and then appends with
//! `ExpectedSequence` pinned to the projection's sequence number, so a
//! decision made on stale state can never be committed.

#![allow(dead_code)]

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use streamfold_es::{
    AppendConstraint, Classification, ClassificationStep, CommandIdentity, EventContext,
    EventEnvelope, EventStore, EventStoreBuilder, ProjectionError, Projection, StepError,
    StepTarget, StreamError, StreamIdentity,
};

pub const DOMAIN: &str = "bank";
pub const ACCOUNT: &str = "account";
pub const INTEREST_COMMAND: &str = "accrue-interest";

/// Domain events of a bank account, amounts in cents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AccountEvent {
    Opened { owner: String },
    OverdraftLimitSet { limit: i64 },
    MoneyDeposited { amount: i64 },
    MoneyWithdrawn { amount: i64 },
    InterestAccrued { amount: i64, rate_bps: u32 },
    Closed,
}

/// Running balance of one account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub current_balance: i64,
    pub overdraft_limit: i64,
}

impl Projection for Balance {
    const NAME: &'static str = "balance";
    const HANDLES: &'static [&'static str] = &[
        "OverdraftLimitSet",
        "MoneyDeposited",
        "MoneyWithdrawn",
        "InterestAccrued",
    ];

    fn apply(&mut self, event: &EventEnvelope) {
        match event.decode::<AccountEvent>() {
            Some(AccountEvent::OverdraftLimitSet { limit }) => self.overdraft_limit = limit,
            Some(AccountEvent::MoneyDeposited { amount }) => self.current_balance += amount,
            Some(AccountEvent::MoneyWithdrawn { amount }) => self.current_balance -= amount,
            Some(AccountEvent::InterestAccrued { amount, .. }) => self.current_balance += amount,
            _ => {}
        }
    }
}

/// Accounts that are open: included on `Opened`, excluded on `Closed`.
#[derive(Debug, Default)]
pub struct OpenAccount;

impl Classification for OpenAccount {
    const NAME: &'static str = "open-account";
    const HANDLES: &'static [&'static str] = &["Opened", "Closed"];

    fn evaluate(&mut self, event: &EventEnvelope) -> ClassificationStep {
        match event.event_type.as_str() {
            "Opened" => ClassificationStep::Include,
            "Closed" => ClassificationStep::Exclude,
            _ => ClassificationStep::Unchanged,
        }
    }
}

/// Errors returned by account operations.
#[derive(Debug, thiserror::Error)]
pub enum BankError {
    #[error("amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("account '{0}' does not exist")]
    NotFound(String),
    #[error("account '{0}' is closed")]
    Closed(String),
    #[error("insufficient funds: balance {balance} + overdraft {overdraft} < {amount}")]
    InsufficientFunds {
        balance: i64,
        overdraft: i64,
        amount: i64,
    },
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Projection(#[from] ProjectionError),
    #[error(transparent)]
    Step(#[from] StepError),
}

pub fn account(key: &str) -> StreamIdentity {
    StreamIdentity::new(DOMAIN, ACCOUNT, key)
}

/// A builder with the bank projection and classification registered.
pub fn builder() -> EventStoreBuilder {
    EventStoreBuilder::new()
        .projection::<Balance>()
        .classification::<OpenAccount>()
}

fn positive(amount: i64) -> Result<i64, BankError> {
    if amount <= 0 {
        return Err(BankError::InvalidAmount(amount));
    }
    Ok(amount)
}

/// Create the account stream. Fails with `StreamError::AlreadyExists` if
/// the key is taken.
pub async fn open_account(store: &EventStore, key: &str, owner: &str) -> Result<u64, BankError> {
    let seq = store
        .stream(account(key))
        .append_event(
            &AccountEvent::Opened {
                owner: owner.to_string(),
            },
            &EventContext::default().with_source("bank-demo"),
            AppendConstraint::MustBeNew,
        )
        .await?;
    Ok(seq)
}

/// Current balance snapshot of an open account.
///
/// An absent projection means the account does not exist, which fails
/// here instead of being read as a zero balance.
async fn open_balance(
    store: &EventStore,
    key: &str,
) -> Result<streamfold_es::ProjectionSnapshot<Balance>, BankError> {
    let snapshot = store
        .process::<Balance>(account(key), None)
        .await?
        .ok_or_else(|| BankError::NotFound(key.to_string()))?;
    let verdict = store.classify::<OpenAccount>(account(key), None).await?;
    if !verdict.is_included() {
        return Err(BankError::Closed(key.to_string()));
    }
    Ok(snapshot)
}

/// Write `event` only if nothing was appended since `snapshot` was taken.
async fn commit(
    store: &EventStore,
    key: &str,
    event: &AccountEvent,
    ctx: &EventContext,
    seen_sequence: u64,
) -> Result<u64, BankError> {
    let seq = store
        .stream(account(key))
        .append_event(event, ctx, AppendConstraint::ExpectedSequence(seen_sequence))
        .await?;
    Ok(seq)
}

pub async fn set_overdraft_limit(
    store: &EventStore,
    key: &str,
    limit: i64,
) -> Result<u64, BankError> {
    if limit < 0 {
        return Err(BankError::InvalidAmount(limit));
    }
    let snapshot = open_balance(store, key).await?;
    commit(
        store,
        key,
        &AccountEvent::OverdraftLimitSet { limit },
        &EventContext::default(),
        snapshot.current_sequence_number,
    )
    .await
}

pub async fn deposit(store: &EventStore, key: &str, amount: i64) -> Result<u64, BankError> {
    deposit_with(store, key, amount, &EventContext::default()).await
}

/// Deposit with explicit context, e.g. a backdated effective date.
pub async fn deposit_with(
    store: &EventStore,
    key: &str,
    amount: i64,
    ctx: &EventContext,
) -> Result<u64, BankError> {
    let amount = positive(amount)?;
    let snapshot = open_balance(store, key).await?;
    commit(
        store,
        key,
        &AccountEvent::MoneyDeposited { amount },
        ctx,
        snapshot.current_sequence_number,
    )
    .await
}

/// Withdraw if balance plus overdraft covers `amount`.
pub async fn withdraw(store: &EventStore, key: &str, amount: i64) -> Result<u64, BankError> {
    let amount = positive(amount)?;
    let snapshot = open_balance(store, key).await?;
    let Balance {
        current_balance,
        overdraft_limit,
    } = snapshot.state;
    if current_balance + overdraft_limit < amount {
        return Err(BankError::InsufficientFunds {
            balance: current_balance,
            overdraft: overdraft_limit,
            amount,
        });
    }
    commit(
        store,
        key,
        &AccountEvent::MoneyWithdrawn { amount },
        &EventContext::default(),
        snapshot.current_sequence_number,
    )
    .await
}

pub async fn close_account(store: &EventStore, key: &str) -> Result<u64, BankError> {
    let snapshot = open_balance(store, key).await?;
    commit(
        store,
        key,
        &AccountEvent::Closed,
        &EventContext::default(),
        snapshot.current_sequence_number,
    )
    .await
}

/// Interest for one account, rounded toward zero. Negative balances earn
/// nothing.
pub fn interest_on(balance: i64, rate_bps: u32) -> i64 {
    if balance <= 0 {
        return 0;
    }
    balance * i64::from(rate_bps) / 10_000
}

/// Outcome of an interest run over every open account.
#[derive(Debug)]
pub struct InterestRun {
    pub command: CommandIdentity,
    /// Accounts credited, with the amount.
    pub accrued: Vec<(String, i64)>,
    /// Accounts left untouched, with the reason.
    pub failed: Vec<(String, String)>,
    /// Credited accounts whose step outcome could not be recorded.
    pub unrecorded: Vec<(String, String)>,
}

/// What happened to one account: the business outcome, and the step
/// bookkeeping error if recording that outcome failed afterwards.
struct Accrual {
    outcome: Result<i64, BankError>,
    unrecorded: Option<StepError>,
}

async fn accrue_one(
    store: &EventStore,
    command: &CommandIdentity,
    key: &str,
    rate_bps: u32,
) -> Accrual {
    let tracker = store.command(command.clone());
    if let Err(e) = tracker
        .initiate_step(key, StepTarget::from(&account(key)))
        .await
    {
        return Accrual {
            outcome: Err(e.into()),
            unrecorded: None,
        };
    }

    let outcome = async {
        let snapshot = open_balance(store, key).await?;
        let amount = interest_on(snapshot.state.current_balance, rate_bps);
        commit(
            store,
            key,
            &AccountEvent::InterestAccrued { amount, rate_bps },
            &EventContext::default().with_correlation_id(command.instance_id.clone()),
            snapshot.current_sequence_number,
        )
        .await?;
        Ok::<_, BankError>(amount)
    }
    .await;

    // The account outcome is settled at this point, whatever the step log says.
    let recorded = match &outcome {
        Ok(amount) => {
            tracker
                .step_completed(key, Some(format!("accrued {amount}")))
                .await
        }
        Err(e) => tracker.step_failed(key, e.to_string()).await,
    };
    Accrual {
        outcome,
        unrecorded: recorded.err(),
    }
}

/// Accrue interest on every open account under a fresh command instance.
///
/// Each account is one step of the command. Failures are collected, not
/// propagated, so one bad account does not stop the run. The command fails
/// if any account failed or any step outcome went unrecorded.
pub async fn accrue_interest(store: &EventStore, rate_bps: u32) -> Result<InterestRun, BankError> {
    let command = CommandIdentity::new_instance(DOMAIN, INTEREST_COMMAND);
    let keys: Vec<String> = store
        .get_all_instance_keys(DOMAIN, ACCOUNT, OpenAccount::NAME)
        .await?
        .try_collect()
        .await?;

    let results = futures::future::join_all(
        keys.iter()
            .map(|key| accrue_one(store, &command, key, rate_bps)),
    )
    .await;

    let mut run = InterestRun {
        command: command.clone(),
        accrued: Vec::new(),
        failed: Vec::new(),
        unrecorded: Vec::new(),
    };
    for (key, accrual) in keys.into_iter().zip(results) {
        if let Some(e) = accrual.unrecorded {
            tracing::warn!(account = %key, error = %e, "interest step outcome not recorded");
            run.unrecorded.push((key.clone(), e.to_string()));
        }
        match accrual.outcome {
            Ok(amount) => run.accrued.push((key, amount)),
            Err(e) => run.failed.push((key, e.to_string())),
        }
    }

    let summary = format!(
        "{} accrued, {} failed, {} unrecorded",
        run.accrued.len(),
        run.failed.len(),
        run.unrecorded.len()
    );
    let tracker = store.command(command);
    if run.failed.is_empty() && run.unrecorded.is_empty() {
        tracker.complete(Some(summary)).await?;
    } else {
        tracker.fail(summary).await?;
    }
    Ok(run)
}
