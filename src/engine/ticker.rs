use crate::engine::TimerEngine;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Handle тик-драйвера. Drop или cancel() останавливают цикл после текущего тика.
pub struct TickHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TickHandle {
    /// Запустить периодический тик (1 Гц) для engine.
    /// Держит только Weak - драйвер не продлевает жизнь engine.
    pub(crate) fn spawn(engine: Weak<TimerEngine>, period: Duration) -> Self {
        let token = CancellationToken::new();
        let child = token.clone();

        let join = tokio::spawn(async move {
            // Первый тик через period после старта, не сразу
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => {
                        debug!("[TICK] Driver cancelled");
                        break;
                    }
                    _ = interval.tick() => {}
                }

                let Some(engine) = engine.upgrade() else {
                    debug!("[TICK] Engine dropped, stopping driver");
                    break;
                };

                // Ошибка тика не должна останавливать цикл
                match engine.tick().await {
                    Ok(Some(report)) => trace!("[TICK] {}", report.formatted),
                    Ok(None) => {
                        debug!("[TICK] Timer is not running, stopping driver");
                        break;
                    }
                    Err(e) => error!("[TICK] Tick failed: {}", e),
                }
            }
        });

        Self { token, join }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
