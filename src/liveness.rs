use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::rpc::{JsonRpcNotification, RpcWriter};

/// When the last request arrived, shared between the request loop and the
/// keep-alive task.
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        self.last_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    pub fn idle(&self) -> Duration {
        let last = self.last_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.elapsed_ms().saturating_sub(last))
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Write `$/alive` whenever the session has been quiet for `idle_after`.
///
/// At most one notification per `idle_after` window. The task ends on its own
/// once the output can no longer be written.
pub fn spawn_keepalive<W>(
    clock: Arc<ActivityClock>,
    output: RpcWriter<W>,
    interval: Duration,
    idle_after: Duration,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_sent: Option<Instant> = None;

        loop {
            ticker.tick().await;
            if clock.idle() < idle_after {
                continue;
            }
            if last_sent.is_some_and(|sent| sent.elapsed() < idle_after) {
                continue;
            }
            debug!("Idle for {:?}, sending $/alive", clock.idle());
            if let Err(e) = output.send(&JsonRpcNotification::alive()).await {
                debug!("Keep-alive stopped: {e}");
                break;
            }
            last_sent = Some(Instant::now());
        }
    })
}
