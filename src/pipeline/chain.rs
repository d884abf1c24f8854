//! Rule Chain agent
//!
//! Sequential evaluation over the endpoint's rules. The first terminal
//! outcome (pass, fail, or error) stops the chain; later rules are neither
//! executed nor recorded. A chain that runs out of rules without a terminal
//! outcome is a pass, as is an empty chain. Every rule observes exactly the
//! exports of the rules before it.

use crate::pipeline::rule_exec::{execute_rule, ChainContext};
use crate::pipeline::state::{Outcome, RequestState};

/// Run the rule chain to its first terminal outcome
pub async fn run(state: &mut RequestState, ctx: &ChainContext<'_>) {
    for rule in &ctx.endpoint.rules {
        execute_rule(state, rule, ctx).await;
        if state.rule.outcome.is_terminal() {
            tracing::debug!(
                endpoint = %ctx.endpoint.name,
                rule = %rule.name,
                outcome = %state.rule.outcome,
                correlation_id = %state.correlation_id,
                "rule chain settled"
            );
            return;
        }
    }

    state
        .rule
        .settle(Outcome::Pass, "rule chain exhausted without fail or error");
}
