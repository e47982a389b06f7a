use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};

use peerswap::swap::{Swap, SwapState};

use super::node::TestNode;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls `f` until it yields a value, backing off from 10ms to 200ms.
pub async fn wait_for<T, F, Fut>(description: &str, timeout: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut sleep_for = Duration::from_millis(10);

    loop {
        if Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for {description}");
        }

        if let Some(value) = f().await.with_context(|| format!("poll {description}"))? {
            return Ok(value);
        }

        tokio::time::sleep(sleep_for).await;
        sleep_for = (sleep_for * 2).min(Duration::from_millis(200));
    }
}

/// Waits until `node` has persisted `swap_id` in `state`.
pub async fn wait_for_state(node: &TestNode, swap_id: &str, state: SwapState) -> Result<Swap> {
    let description = format!("{} to reach {state} on {}", swap_id, node.id);
    wait_for(&description, STEP_TIMEOUT, move || async move {
        Ok::<_, anyhow::Error>(node.stored(swap_id)?.filter(|s| s.state == state))
    })
    .await
}
