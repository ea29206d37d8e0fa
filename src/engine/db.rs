use crate::engine::{
    ActiveProject, EngineState, ProjectTimerState, TimerEngine, TimerError, TimerStateResponse,
};
use crate::storage::SnapshotMap;
use std::sync::TryLockError;
use tracing::{debug, info, warn};

impl TimerEngine {
    /// Сохранить snapshot активного проекта.
    /// Публичный метод для явного сохранения (periodic save, выход из приложения)
    pub fn save_state(&self) -> Result<(), TimerError> {
        let state = self.lock_state()?;
        let pending = self.pending_snapshot(&state);
        drop(state); // Освобождаем lock перед записью в хранилище

        let Some((project_id, timer, generation)) = pending else {
            debug!("[TIMER] Nothing to save");
            return Ok(());
        };
        // Переход после снятия snapshot'а пишет своё состояние сам
        self.write_if_current(&project_id, &timer, generation)?;
        debug!(
            "[TIMER] Snapshot of {} saved ({:?}, {}ms)",
            project_id, timer.status, timer.elapsed_time
        );
        Ok(())
    }

    /// Вариант save_state для panic hook: не ждёт lock (его может держать паникующий поток)
    pub fn try_save_state(&self) -> Result<(), TimerError> {
        let state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => {
                return Err(TimerError::LockPoisoned(
                    "state is locked, snapshot not saved".to_string(),
                ))
            }
            Err(TryLockError::Poisoned(e)) => return Err(TimerError::LockPoisoned(e.to_string())),
        };
        let pending = self.pending_snapshot(&state);
        drop(state);

        // Без проверки номера перехода: panic hook не должен ждать lock
        let Some((project_id, timer, _)) = pending else {
            return Ok(());
        };
        self.snapshots.put(&project_id, &timer)?;
        Ok(())
    }

    /// Восстановить активный проект при старте сессии (без записи и без activate на сервере).
    /// Если проект был RUNNING, elapsed пересчитывается и тик-драйвер запускается.
    pub fn restore_active(
        &self,
        project_id: &str,
        project_name: &str,
    ) -> Result<TimerStateResponse, TimerError> {
        let mut snapshot = self.snapshots.get(project_id)?.unwrap_or_default();
        let now = self.clock.now_ms();

        let running = {
            let mut state = self.lock_state()?;
            if let Some(active) = &state.active {
                warn!(
                    "[TIMER] Restore of {} skipped: {} is already active",
                    project_id, active.id
                );
                return Ok(self.build_response(&state, now));
            }
            if snapshot.is_running() {
                snapshot.elapsed_time = snapshot.live_elapsed(now);
            }
            let running = snapshot.is_running();
            state.active = Some(ActiveProject {
                id: project_id.to_string(),
                name: project_name.to_string(),
            });
            state.timer = snapshot;
            state.bump();
            running
        };

        let restored = self.get_state()?;
        info!(
            "[TIMER] Restored {} ({:?}, {})",
            project_id, restored.status, restored.formatted
        );
        if running {
            self.start_ticker();
        }
        Ok(restored)
    }

    /// Все сохранённые snapshot'ы (статус каждого проекта)
    pub fn project_snapshots(&self) -> Result<SnapshotMap, TimerError> {
        Ok(self.snapshots.load_all()?)
    }

    /// Snapshot для записи и номер перехода, на котором он снят.
    /// IDLE не сохраняется (finish уже удалил запись проекта)
    fn pending_snapshot(&self, state: &EngineState) -> Option<(String, ProjectTimerState, u64)> {
        let active = state.active.as_ref()?;
        if state.timer.is_idle() {
            return None;
        }
        let mut timer = state.timer.clone();
        timer.elapsed_time = timer.live_elapsed(self.clock.now_ms());
        Some((active.id.clone(), timer, state.generation))
    }
}
