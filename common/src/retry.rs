use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::StoreError;

/// Intervalos de espera exponenciales: `initial`, `2*initial`, ... hasta `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = (current * 2).min(self.max);
        Some(current)
    }
}

/// Ejecuta `op` hasta `policy.max_attempts` veces mientras el error sea transitorio.
/// Los errores no transitorios se devuelven enseguida.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delays = Backoff::new(policy.base_delay, policy.max_delay);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = delays.next().unwrap_or(policy.max_delay);
                warn!(
                    "{} falló (intento {}/{}): {}; reintento en {:?}",
                    what, attempt, policy.max_attempts, e, delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
