use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use conduit_core::result::{ErrorKind, NodeFailure};

use crate::board::BranchBoard;
use crate::context::ExecutionContext;
use crate::report::PathOutcome;

/// Join policy of a fork.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinMode {
    /// Every branch; the first failure fails the fork unless `continue_on_error`.
    #[default]
    All,
    /// First success.
    Any,
    /// First terminal state, success or failure.
    Race,
    /// Every branch, never failing.
    Settled,
}

impl JoinMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(Self::All),
            "any" => Some(Self::Any),
            "race" => Some(Self::Race),
            "settled" => Some(Self::Settled),
            _ => None,
        }
    }
}

/// One fan-out target.
#[derive(Debug, Clone)]
pub struct Branch {
    pub name: String,
    pub start: String,
}

/// How a fork runs its branches.
#[derive(Clone, Default)]
pub struct ForkPlan {
    pub mode: JoinMode,
    pub continue_on_error: bool,
    /// Simultaneous branches; 0 is unbounded. Excess branches queue in edge order.
    pub max_concurrency: usize,
    pub branch_timeout: Option<Duration>,
    /// Node at which each branch path stops (the paired merge).
    pub stop_at: Option<String>,
    /// Board the branches publish into.
    pub board: Option<Arc<BranchBoard>>,
}

#[derive(Debug, Clone)]
enum BranchOutcome {
    Succeeded(Value),
    Failed(NodeFailure),
}

/// Aggregate of a settled (or short-circuited) fork.
#[derive(Debug, Clone, Default)]
pub struct ForkOutcome {
    /// Successful branches in completion order.
    pub results: Vec<(String, Value)>,
    /// Failed branches in completion order.
    pub errors: Vec<(String, NodeFailure)>,
    /// Branch that decided an `any` / `race` join.
    pub winner: Option<String>,
    /// Set when the join policy fails the fork.
    pub failure: Option<NodeFailure>,
    pub cancelled: bool,
}

/// Runs a fork's branches concurrently and applies the join policy.
///
/// Each branch re-enters the walker with the run's context under its own
/// cancellation token. A driver task owns the branches so that `any` and
/// `race` joins can return while the rest keep running; those stragglers
/// still publish into the board and are cancelled with the run.
pub struct ForkJoinManager;

impl ForkJoinManager {
    pub async fn run(ctx: &ExecutionContext, branches: Vec<Branch>, plan: ForkPlan) -> ForkOutcome {
        let total = branches.len();
        let names: Vec<String> = branches.iter().map(|b| b.name.clone()).collect();
        let fork_cancel = ctx.cancel.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, BranchOutcome)>();

        tokio::spawn(drive(ctx.clone(), branches, plan.clone(), fork_cancel.clone(), tx));

        let mut outcome = ForkOutcome::default();
        let mut settled = 0usize;

        while settled < total {
            let message = tokio::select! {
                message = rx.recv() => message,
                _ = ctx.cancel.cancelled() => {
                    fork_cancel.cancel();
                    outcome.cancelled = true;
                    return outcome;
                }
            };
            let Some((index, result)) = message else {
                // Driver finished without reporting every branch.
                let unsettled: Vec<String> = names
                    .iter()
                    .filter(|n| !outcome.has_settled(n))
                    .cloned()
                    .collect();
                for name in unsettled {
                    outcome.errors.push((
                        name,
                        NodeFailure::new(ErrorKind::Execution, "branch ended without a result"),
                    ));
                }
                break;
            };
            settled += 1;
            let name = names[index].clone();

            match result {
                BranchOutcome::Succeeded(output) => {
                    outcome.results.push((name.clone(), output));
                    if matches!(plan.mode, JoinMode::Any | JoinMode::Race) {
                        outcome.winner = Some(name);
                        return outcome;
                    }
                }
                BranchOutcome::Failed(failure) => {
                    outcome.errors.push((name.clone(), failure.clone()));
                    match plan.mode {
                        JoinMode::All if !plan.continue_on_error => {
                            fork_cancel.cancel();
                            outcome.failure = Some(branch_failure(&name, &failure));
                            return outcome;
                        }
                        JoinMode::Race => {
                            if !plan.continue_on_error {
                                outcome.failure = Some(branch_failure(&name, &failure));
                            }
                            outcome.winner = Some(name);
                            return outcome;
                        }
                        _ => {}
                    }
                }
            }
        }

        if plan.mode == JoinMode::Any && outcome.results.is_empty() {
            let kind = outcome
                .errors
                .last()
                .map(|(_, f)| f.kind)
                .unwrap_or(ErrorKind::Execution);
            outcome.failure = Some(NodeFailure::new(
                kind,
                format!("none of {} branches succeeded", total),
            ));
        } else if plan.mode == JoinMode::All && !outcome.errors.is_empty() {
            warn!(
                node_id = %ctx.node.id,
                failed = outcome.errors.len(),
                total,
                "Fork joined with failed branches"
            );
        }

        outcome
    }
}

impl ForkOutcome {
    fn has_settled(&self, name: &str) -> bool {
        self.results.iter().any(|(n, _)| n == name) || self.errors.iter().any(|(n, _)| n == name)
    }
}

fn branch_failure(name: &str, failure: &NodeFailure) -> NodeFailure {
    let mut f = NodeFailure::new(failure.kind, format!("branch '{}' failed: {}", name, failure.message));
    f.code = failure.code.clone();
    f
}

/// Spawns branches in edge order, keeping at most `max_concurrency` in flight.
async fn drive(
    ctx: ExecutionContext,
    branches: Vec<Branch>,
    plan: ForkPlan,
    fork_cancel: CancellationToken,
    tx: mpsc::UnboundedSender<(usize, BranchOutcome)>,
) {
    let mut set = JoinSet::new();
    let mut queue = branches.into_iter().enumerate();

    loop {
        while plan.max_concurrency == 0 || set.len() < plan.max_concurrency {
            let Some((index, branch)) = queue.next() else {
                break;
            };
            set.spawn(run_branch(
                ctx.clone(),
                index,
                branch,
                plan.clone(),
                fork_cancel.child_token(),
                tx.clone(),
            ));
        }
        if set.join_next().await.is_none() {
            break;
        }
    }
}

async fn run_branch(
    ctx: ExecutionContext,
    index: usize,
    branch: Branch,
    plan: ForkPlan,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<(usize, BranchOutcome)>,
) {
    let branch_ctx = ctx.with_cancel(token.clone());
    debug!(
        execution_id = %ctx.execution_id,
        branch = %branch.name,
        start = %branch.start,
        "Branch started"
    );

    let walk = ctx
        .engine
        .run_path(&branch_ctx, &branch.start, plan.stop_at.as_deref());
    let walked = match plan.branch_timeout {
        Some(limit) => match tokio::time::timeout(limit, walk).await {
            Ok(outcome) => Some(outcome),
            Err(_) => {
                token.cancel();
                None
            }
        },
        None => Some(walk.await),
    };

    let outcome = match walked {
        Some(PathOutcome::Completed { output }) => BranchOutcome::Succeeded(output),
        Some(PathOutcome::Failed(f)) => BranchOutcome::Failed(f.to_node_failure()),
        Some(PathOutcome::Cancelled) => BranchOutcome::Failed(NodeFailure::aborted()),
        None => BranchOutcome::Failed(NodeFailure::timeout(format!(
            "branch exceeded {}ms",
            plan.branch_timeout.map(|d| d.as_millis()).unwrap_or_default()
        ))),
    };

    if let Some(board) = &plan.board {
        match &outcome {
            BranchOutcome::Succeeded(output) => board.arrive(&branch.name, output.clone()),
            BranchOutcome::Failed(f) => board.fail(&branch.name, f.to_string()),
        }
    }

    debug!(
        execution_id = %ctx.execution_id,
        branch = %branch.name,
        succeeded = matches!(outcome, BranchOutcome::Succeeded(_)),
        "Branch finished"
    );
    // Receiver is gone once an any/race join has returned.
    let _ = tx.send((index, outcome));
}
