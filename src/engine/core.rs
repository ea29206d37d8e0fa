use crate::engine::{
    ActiveProject, EngineState, ProjectTimerState, TickHandle, TickReport, TimerEngine,
    TimerError, TimerStateResponse, TimerStatus,
};
use crate::format::format_time;
use crate::notifications::{evaluate_marks, MarkCrossings, Notification};
use crate::recorder::{RecordKind, RecordOutcome, Segment};
use crate::storage::StorageError;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

/// Переход toggle, вычисленный под lock. I/O выполняется после освобождения lock.
enum Toggle {
    Paused {
        active: ActiveProject,
        snapshot: ProjectTimerState,
        segment: Option<Segment>,
    },
    Resumed {
        active: ActiveProject,
        snapshot: ProjectTimerState,
    },
    Started {
        active: ActiveProject,
        snapshot: ProjectTimerState,
    },
}

enum TickOutcome {
    Running {
        active: ActiveProject,
        snapshot: ProjectTimerState,
        crossings: MarkCrossings,
        generation: u64,
    },
    LimitReached {
        active: ActiveProject,
        limit: u64,
        segment: Option<Segment>,
    },
}

/// RUNNING → PAUSED с замороженным elapsed
fn freeze(timer: &mut ProjectTimerState, now_ms: i64) {
    if timer.is_running() {
        let elapsed = timer.live_elapsed(now_ms);
        timer.elapsed_time = elapsed;
        timer.paused_elapsed_time = elapsed;
        timer.start_time = 0;
        timer.status = TimerStatus::Paused;
    }
}

/// Забрать незаписанную часть elapsed как сегмент. Вызывается только под lock:
/// после этого повторный вызов (пауза, тик, finish) не увидит те же миллисекунды.
fn take_segment(
    active: &ActiveProject,
    timer: &mut ProjectTimerState,
    now_ms: i64,
) -> Option<Segment> {
    let unrecorded = timer.unrecorded_elapsed();
    if unrecorded == 0 {
        return None;
    }
    timer.recorded_elapsed = timer.elapsed_time;

    let span = i64::try_from(unrecorded).unwrap_or(i64::MAX);
    Some(Segment {
        project_id: active.id.clone(),
        project_name: active.name.clone(),
        work_type_id: timer.work_type_id.clone(),
        start_time_ms: now_ms.saturating_sub(span),
        end_time_ms: now_ms,
        elapsed_ms: unrecorded,
        time_limit_ms: timer.time_limit,
    })
}

impl TimerEngine {
    /// Переключение активного проекта.
    /// Уходящий RUNNING проект замораживается в PAUSED и его сегмент записывается.
    pub async fn switch_project(
        &self,
        project_id: &str,
        project_name: &str,
    ) -> Result<TimerStateResponse, TimerError> {
        if self.is_active(project_id)? {
            debug!("[TIMER] Switch to {} ignored: already active", project_id);
            return self.get_state();
        }

        // Чтение хранилища - до захвата lock
        let incoming = match self.snapshots.get(project_id) {
            Ok(snapshot) => snapshot.unwrap_or_default(),
            Err(e) => {
                warn!(
                    "[TIMER] Failed to load snapshot for {}: {}. Starting from idle.",
                    project_id, e
                );
                ProjectTimerState::default()
            }
        };

        let now = self.clock.now_ms();
        let (outgoing, incoming_running) = {
            let mut state = self.lock_state()?;
            if state.active.as_ref().is_some_and(|a| a.id == project_id) {
                return Ok(self.build_response(&state, now));
            }

            let outgoing = state.active.take().map(|active| {
                let was_running = state.timer.is_running();
                freeze(&mut state.timer, now);
                let segment = if was_running {
                    take_segment(&active, &mut state.timer, now)
                } else {
                    None
                };
                (active, state.timer.clone(), segment)
            });

            let mut incoming = incoming;
            if incoming.is_running() {
                // Проект был RUNNING в другой сессии: elapsed = now - startTime
                incoming.elapsed_time = incoming.live_elapsed(now);
            }
            let incoming_running = incoming.is_running();
            state.active = Some(ActiveProject {
                id: project_id.to_string(),
                name: project_name.to_string(),
            });
            state.timer = incoming;
            state.bump();
            (outgoing, incoming_running)
        };

        self.stop_ticker();

        if let Some((active, snapshot, segment)) = outgoing {
            self.persist(&active.id, &snapshot, "switch");
            if let Some(segment) = segment {
                let outcome = self.recorder.record(&segment, RecordKind::Switch).await;
                if !outcome.is_recorded() {
                    self.release_segment(&segment);
                }
            }
            info!(
                "[TIMER] Switched {} → {} (left {:?} at {}ms)",
                active.id, project_id, snapshot.status, snapshot.elapsed_time
            );
        } else {
            info!("[TIMER] Project {} selected", project_id);
        }

        if let Err(e) = self.api.activate_project(project_id).await {
            warn!("[TIMER] Failed to activate project {} on server: {}", project_id, e);
        }

        if incoming_running {
            self.start_ticker();
        }

        self.get_state()
    }

    /// Start / pause / resume активного проекта
    pub async fn toggle_timer(&self) -> Result<TimerStateResponse, TimerError> {
        let now = self.clock.now_ms();
        let (transition, generation) = {
            let mut state = self.lock_state()?;
            let Some(active) = state.active.clone() else {
                warn!("[TIMER] Toggle ignored: no project selected");
                return Err(TimerError::NoActiveProject);
            };
            let timer = &mut state.timer;

            let transition = match timer.status {
                TimerStatus::Running => {
                    freeze(timer, now);
                    // Случайный toggle: пауза без записи
                    let segment = if timer.elapsed_time <= self.options.quick_toggle_ms {
                        debug!(
                            "[TIMER] Quick toggle on {} ({}ms), pausing without entry",
                            active.id, timer.elapsed_time
                        );
                        None
                    } else {
                        take_segment(&active, timer, now)
                    };
                    Toggle::Paused {
                        active,
                        snapshot: timer.clone(),
                        segment,
                    }
                }
                TimerStatus::Paused => {
                    let paused = i64::try_from(timer.paused_elapsed_time).unwrap_or(i64::MAX);
                    timer.start_time = now.saturating_sub(paused);
                    timer.status = TimerStatus::Running;
                    Toggle::Resumed {
                        active,
                        snapshot: timer.clone(),
                    }
                }
                TimerStatus::Idle => {
                    // Новый старт: elapsed и отметки с нуля, тип работы и лимит сохраняются
                    *timer = ProjectTimerState {
                        status: TimerStatus::Running,
                        start_time: now,
                        work_type_id: timer.work_type_id.take(),
                        work_type_name: std::mem::take(&mut timer.work_type_name),
                        time_limit: timer.time_limit,
                        ..ProjectTimerState::default()
                    };
                    Toggle::Started {
                        active,
                        snapshot: timer.clone(),
                    }
                }
            };
            (transition, state.bump())
        };

        match transition {
            Toggle::Paused {
                active,
                snapshot,
                segment,
            } => {
                self.stop_ticker();
                self.persist_if_current(&active.id, &snapshot, generation, "pause");
                info!(
                    "[TIMER] Paused {} at {}",
                    active.id,
                    format_time(snapshot.elapsed_time)
                );
                if let Some(segment) = segment {
                    let outcome = self.recorder.record(&segment, RecordKind::Pause).await;
                    if !outcome.is_recorded() {
                        self.release_segment(&segment);
                    }
                }
            }
            Toggle::Resumed { active, snapshot } => {
                self.persist_if_current(&active.id, &snapshot, generation, "resume");
                info!(
                    "[TIMER] Resumed {} from {}",
                    active.id,
                    format_time(snapshot.paused_elapsed_time)
                );
                self.start_ticker();
            }
            Toggle::Started { active, snapshot } => {
                self.persist_if_current(&active.id, &snapshot, generation, "start");
                info!("[TIMER] Started {}", active.id);
                self.notifier.notify(&Notification::work_started(&active.name));
                self.start_ticker();
            }
        }

        self.get_state()
    }

    /// Завершить задачу: записать сегмент, перейти в IDLE, удалить snapshot проекта.
    /// Повторный вызов подряд ничего не записывает.
    pub async fn finish_task(&self) -> Result<TimerStateResponse, TimerError> {
        let now = self.clock.now_ms();
        let finished = {
            let mut state = self.lock_state()?;
            let Some(active) = state.active.clone() else {
                warn!("[TIMER] Finish ignored: no project selected");
                return Err(TimerError::NoActiveProject);
            };

            if state.timer.is_idle() && state.timer.unrecorded_elapsed() == 0 {
                debug!("[TIMER] Finish ignored: {} is already idle", active.id);
                None
            } else {
                freeze(&mut state.timer, now);
                let segment = take_segment(&active, &mut state.timer, now);
                state.timer = ProjectTimerState {
                    work_type_id: state.timer.work_type_id.take(),
                    work_type_name: std::mem::take(&mut state.timer.work_type_name),
                    ..ProjectTimerState::default()
                };
                state.bump();
                Some((active, segment))
            }
        };

        if let Some((active, segment)) = finished {
            self.complete_finish(&active, segment).await;
        }

        self.get_state()
    }

    /// Сбросить таймер активного проекта без записи
    pub fn reset_timer(&self) -> Result<TimerStateResponse, TimerError> {
        let (active, discarded) = {
            let mut state = self.lock_state()?;
            let Some(active) = state.active.clone() else {
                return Err(TimerError::NoActiveProject);
            };
            let discarded = state.timer.live_elapsed(self.clock.now_ms());
            state.timer = ProjectTimerState {
                work_type_id: state.timer.work_type_id.take(),
                work_type_name: std::mem::take(&mut state.timer.work_type_name),
                time_limit: state.timer.time_limit,
                ..ProjectTimerState::default()
            };
            state.bump();
            (active, discarded)
        };

        self.stop_ticker();
        if let Err(e) = self.snapshots.remove(&active.id) {
            error!("[TIMER] Failed to remove snapshot after reset: {}", e);
        }
        info!("[TIMER] Reset {} (discarded {}ms)", active.id, discarded);
        self.get_state()
    }

    pub fn set_work_type(
        &self,
        work_type_id: Option<String>,
        work_type_name: String,
    ) -> Result<TimerStateResponse, TimerError> {
        let (active, snapshot, generation) = {
            let mut state = self.lock_state()?;
            let Some(active) = state.active.clone() else {
                return Err(TimerError::NoActiveProject);
            };
            state.timer.work_type_id = work_type_id;
            state.timer.work_type_name = work_type_name;
            (active, state.timer.clone(), state.bump())
        };

        if !snapshot.is_idle() {
            self.persist_if_current(&active.id, &snapshot, generation, "work type change");
        }
        self.get_state()
    }

    /// Лимит времени (ms); None или 0 - без лимита
    pub fn set_time_limit(&self, limit_ms: Option<u64>) -> Result<TimerStateResponse, TimerError> {
        let limit_ms = limit_ms.filter(|limit| *limit > 0);
        let (active, snapshot, generation) = {
            let mut state = self.lock_state()?;
            let Some(active) = state.active.clone() else {
                return Err(TimerError::NoActiveProject);
            };
            state.timer.time_limit = limit_ms;
            (active, state.timer.clone(), state.bump())
        };

        match limit_ms {
            Some(limit) => info!("[TIMER] Time limit for {} set to {}ms", active.id, limit),
            None => info!("[TIMER] Time limit for {} cleared", active.id),
        }
        if !snapshot.is_idle() {
            self.persist_if_current(&active.id, &snapshot, generation, "time limit change");
        }
        self.get_state()
    }

    /// Текущее состояние (elapsed пересчитан от абсолютного времени)
    pub fn get_state(&self) -> Result<TimerStateResponse, TimerError> {
        let now = self.clock.now_ms();
        let state = self.lock_state()?;
        Ok(self.build_response(&state, now))
    }

    /// Один тик: elapsed, отметки, лимит, сохранение snapshot.
    /// Ok(None) - таймер не RUNNING, тик-драйвер должен остановиться.
    pub async fn tick(&self) -> Result<Option<TickReport>, TimerError> {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now_ms();

        let outcome = {
            let mut state = self.lock_state()?;
            let Some(active) = state.active.clone() else {
                return Ok(None);
            };
            if !state.timer.is_running() {
                return Ok(None);
            }

            let generation = state.generation;
            let timer = &mut state.timer;
            timer.elapsed_time = timer.live_elapsed(now);

            let limit_hit = timer
                .time_limit
                .filter(|limit| timer.elapsed_time >= *limit);
            match limit_hit {
                // Проверка лимита и переход в IDLE под одним lock: выигрывает ровно один тик
                Some(limit) => {
                    freeze(timer, now);
                    let segment = take_segment(&active, timer, now);
                    *timer = ProjectTimerState {
                        work_type_id: timer.work_type_id.take(),
                        work_type_name: std::mem::take(&mut timer.work_type_name),
                        ..ProjectTimerState::default()
                    };
                    state.bump();
                    TickOutcome::LimitReached {
                        active,
                        limit,
                        segment,
                    }
                }
                None => {
                    let crossings =
                        evaluate_marks(timer.elapsed_time, timer.last_hour_mark, timer.last_15_min_mark);
                    if let Some(mark) = crossings.hour {
                        timer.last_hour_mark = mark;
                    }
                    if let Some(mark) = crossings.quarter {
                        timer.last_15_min_mark = mark;
                    }
                    TickOutcome::Running {
                        active,
                        snapshot: timer.clone(),
                        crossings,
                        generation,
                    }
                }
            }
        };

        match outcome {
            TickOutcome::Running {
                active,
                snapshot,
                crossings,
                generation,
            } => {
                if crossings.hour.is_some() {
                    self.notifier
                        .notify(&Notification::hour_mark(&active.name, snapshot.elapsed_time));
                }
                if crossings.quarter.is_some() {
                    self.notifier
                        .notify(&Notification::quarter_mark(&active.name, snapshot.elapsed_time));
                }
                // Pause / finish между снятием snapshot'а и записью: устаревший RUNNING не пишем
                self.write_if_current(&active.id, &snapshot, generation)?;
                Ok(Some(TickReport {
                    project_id: active.id,
                    elapsed_ms: snapshot.elapsed_time,
                    formatted: format_time(snapshot.elapsed_time),
                }))
            }
            TickOutcome::LimitReached {
                active,
                limit,
                segment,
            } => {
                info!("[TIMER] Time limit {}ms reached for {}, finishing", limit, active.id);
                self.notifier
                    .notify(&Notification::limit_reached(&active.name, limit));
                self.complete_finish(&active, segment).await;
                Ok(None)
            }
        }
    }

    /// Тик-драйвер жив
    pub fn is_ticking(&self) -> bool {
        self.ticker
            .lock()
            .map(|ticker| ticker.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false)
    }

    /// Сколько тиков обработано
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn start_ticker(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("[TICK] No tokio runtime, tick driver not started");
            return;
        }
        let mut ticker = match self.ticker.lock() {
            Ok(ticker) => ticker,
            Err(e) => {
                error!("[TICK] Ticker lock poisoned: {}", e);
                return;
            }
        };
        if ticker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *ticker = Some(TickHandle::spawn(
            self.self_ref.clone(),
            self.options.tick_interval,
        ));
        debug!("[TICK] Driver started");
    }

    pub(crate) fn stop_ticker(&self) {
        let handle = match self.ticker.lock() {
            Ok(mut ticker) => ticker.take(),
            Err(e) => {
                error!("[TICK] Ticker lock poisoned: {}", e);
                None
            }
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    fn is_active(&self, project_id: &str) -> Result<bool, TimerError> {
        let state = self.lock_state()?;
        Ok(state.active.as_ref().is_some_and(|a| a.id == project_id))
    }

    pub(crate) fn build_response(&self, state: &EngineState, now_ms: i64) -> TimerStateResponse {
        let elapsed = state.timer.live_elapsed(now_ms);
        TimerStateResponse {
            project: state.active.clone(),
            status: state.timer.status,
            elapsed_ms: elapsed,
            formatted: format_time(elapsed),
            work_type_id: state.timer.work_type_id.clone(),
            work_type_name: state.timer.work_type_name.clone(),
            time_limit_ms: state.timer.time_limit,
            last_hour_mark: state.timer.last_hour_mark,
            last_15_min_mark: state.timer.last_15_min_mark,
            daily_total_ms: self.recorder.daily_total(),
        }
    }

    /// Ошибка сохранения не отменяет переход - только лог
    pub(crate) fn persist(&self, project_id: &str, snapshot: &ProjectTimerState, context: &str) {
        if let Err(e) = self.snapshots.put(project_id, snapshot) {
            error!(
                "[TIMER] Failed to save snapshot of {} after {}: {}",
                project_id, context, e
            );
        }
    }

    /// persist для snapshot'а активного проекта, снятого на переходе `generation`
    pub(crate) fn persist_if_current(
        &self,
        project_id: &str,
        snapshot: &ProjectTimerState,
        generation: u64,
        context: &str,
    ) {
        if let Err(e) = self.write_if_current(project_id, snapshot, generation) {
            error!(
                "[TIMER] Failed to save snapshot of {} after {}: {}",
                project_id, context, e
            );
        }
    }

    /// Записать snapshot, только если после перехода `generation` не было других переходов.
    /// Проверка повторяется на каждой попытке записи: более поздний переход пишет своё состояние
    /// сам, а запись, начатая до него, упирается в конфликт версий и перепроверяет номер.
    pub(crate) fn write_if_current(
        &self,
        project_id: &str,
        snapshot: &ProjectTimerState,
        generation: u64,
    ) -> Result<(), StorageError> {
        self.snapshots.update(|projects| {
            if !self.is_current(project_id, generation) {
                debug!(
                    "[TIMER] Snapshot of {} from transition {} is stale, not saved",
                    project_id, generation
                );
                return false;
            }
            projects.insert(project_id.to_string(), snapshot.clone());
            true
        })
    }

    fn is_current(&self, project_id: &str, generation: u64) -> bool {
        match self.state.lock() {
            Ok(state) => {
                state.generation == generation
                    && state.active.as_ref().is_some_and(|a| a.id == project_id)
            }
            Err(_) => false,
        }
    }

    /// Общая часть finish (пользователь или лимит): тикер, snapshot, запись
    async fn complete_finish(&self, active: &ActiveProject, segment: Option<Segment>) {
        self.stop_ticker();
        if let Err(e) = self.snapshots.remove(&active.id) {
            error!("[TIMER] Failed to remove snapshot of {} after finish: {}", active.id, e);
        }

        let Some(segment) = segment else {
            info!("[TIMER] Finished {}, nothing left to record", active.id);
            return;
        };

        match self.recorder.record(&segment, RecordKind::Finish).await {
            RecordOutcome::Recorded(entry) => {
                info!("[TIMER] Finished {} (entry {})", active.id, entry.id);
            }
            RecordOutcome::Failed(reason) => {
                warn!(
                    "[TIMER] Finish of {} not recorded ({}), keeping {}ms paused for retry",
                    active.id, reason, segment.elapsed_ms
                );
                self.restore_unrecorded(&segment);
            }
            RecordOutcome::SkippedTooShort | RecordOutcome::SkippedInvalidRange => {
                info!("[TIMER] Finished {} without entry", active.id);
            }
        }
    }

    /// Вернуть незаписанный сегмент в PAUSED, чтобы finish можно было повторить
    fn restore_unrecorded(&self, segment: &Segment) {
        let restored = ProjectTimerState {
            status: TimerStatus::Paused,
            elapsed_time: segment.elapsed_ms,
            paused_elapsed_time: segment.elapsed_ms,
            work_type_id: segment.work_type_id.clone(),
            time_limit: segment.time_limit_ms,
            ..ProjectTimerState::default()
        };

        let in_memory = match self.lock_state() {
            Ok(mut state) => {
                let is_same = state
                    .active
                    .as_ref()
                    .is_some_and(|a| a.id == segment.project_id);
                if is_same && state.timer.is_idle() {
                    let work_type_name = std::mem::take(&mut state.timer.work_type_name);
                    state.timer = ProjectTimerState {
                        work_type_name,
                        ..restored.clone()
                    };
                    state.bump();
                    Some(state.timer.clone())
                } else if is_same {
                    error!(
                        "[TIMER] {} restarted before finish failed, {}ms not recorded",
                        segment.project_id, segment.elapsed_ms
                    );
                    return;
                } else {
                    None
                }
            }
            Err(e) => {
                error!("[TIMER] Cannot restore unrecorded segment: {}", e);
                return;
            }
        };

        let result = match in_memory {
            Some(snapshot) => self.snapshots.put(&segment.project_id, &snapshot),
            None => self.snapshots.update(|projects| {
                if projects.contains_key(&segment.project_id) {
                    return false;
                }
                projects.insert(segment.project_id.clone(), restored.clone());
                true
            }),
        };
        if let Err(e) = result {
            error!(
                "[TIMER] Failed to save restored snapshot of {}: {}",
                segment.project_id, e
            );
        }
    }

    /// Сегмент не записан: вернуть его миллисекунды в незаписанные
    fn release_segment(&self, segment: &Segment) {
        let in_memory = match self.lock_state() {
            Ok(mut state) => {
                let is_same = state
                    .active
                    .as_ref()
                    .is_some_and(|a| a.id == segment.project_id);
                if is_same && !state.timer.is_idle() {
                    state.timer.recorded_elapsed =
                        state.timer.recorded_elapsed.saturating_sub(segment.elapsed_ms);
                    state.bump();
                    Some(state.timer.clone())
                } else {
                    None
                }
            }
            Err(e) => {
                error!("[TIMER] Cannot release unrecorded segment: {}", e);
                return;
            }
        };

        let result = match in_memory {
            Some(snapshot) => self.snapshots.put(&segment.project_id, &snapshot),
            None => self.snapshots.update(|projects| match projects.get_mut(&segment.project_id) {
                Some(timer) => {
                    timer.recorded_elapsed = timer.recorded_elapsed.saturating_sub(segment.elapsed_ms);
                    true
                }
                None => false,
            }),
        };
        if let Err(e) = result {
            error!(
                "[TIMER] Failed to save released segment of {}: {}",
                segment.project_id, e
            );
        }
    }
}
