//! Demo application loop.
//!
//! After a startup delay, a distinguished proposer runs a fixed number of
//! rounds. Each round proposes `MyVal{id}-{round}`, waits for the chosen
//! value, and logs it with the elapsed time. Other nodes only serve.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::{RuntimeError, TcpRuntime};
use crate::storage::StateStore;
use crate::types::Round;

/// Settings for [`run_demo`].
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Number of rounds to drive.
    pub rounds: usize,
    /// Pause between rounds.
    pub round_interval: Duration,
    /// Wait before the first round, so peers can connect.
    pub startup_delay: Duration,
    /// Give up waiting on a round after this long and move on.
    pub round_timeout: Option<Duration>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rounds: 10,
            round_interval: Duration::from_millis(100),
            startup_delay: Duration::from_secs(5),
            round_timeout: None,
        }
    }
}

/// The value a node proposes for `round`.
pub fn demo_value(id: usize, round: Round) -> String {
    format!("MyVal{}-{}", id, round.0)
}

/// Drive the demo rounds and return the chosen values observed.
pub async fn run_demo<S: StateStore + 'static>(
    runtime: &mut TcpRuntime<S>,
    config: &AppConfig,
) -> Result<Vec<(Round, String)>, RuntimeError> {
    tokio::time::sleep(config.startup_delay).await;

    let mut chosen = Vec::new();
    if !runtime.node().borrow().is_distinguished_proposer() {
        info!(node = %runtime.id(), "not a distinguished proposer, serving only");
        return Ok(chosen);
    }

    for _ in 0..config.rounds {
        let round = runtime.node().borrow().current_round();
        let started = Instant::now();
        info!(node = %runtime.id(), round = %round, "initiating paxos round");
        runtime.start_round(demo_value(runtime.id().index(), round))?;

        let outcome = match config.round_timeout {
            Some(limit) => tokio::time::timeout(limit, runtime.wait_for_chosen(round))
                .await
                .ok()
                .flatten(),
            None => runtime.wait_for_chosen(round).await,
        };
        match outcome {
            Some(value) => {
                info!(
                    round = %round,
                    value = %value,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "round complete"
                );
                chosen.push((round, value));
            }
            None => warn!(round = %round, "no value chosen in time"),
        }

        tokio::time::sleep(config.round_interval).await;
    }
    Ok(chosen)
}
