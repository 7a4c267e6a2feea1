use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// 실행 제어 상태이다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Running,
    PauseRequested,
    /// 실행 루프가 일시 정지 요청을 받아들여 대기 중이다.
    Paused,
    StopRequested,
}

/// Step 경계에서 실행 루프가 내린 결정이다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Checkpoint {
    Proceed,
    Stop,
}

/// 실행 하나에 대한 제어 핸들이다.
///
/// 외부 호출자는 상태를 바꾸기만 하고, 실행 루프가 Step 사이에서 이를 관찰한다.
#[derive(Debug)]
pub struct ControlHandle {
    state: watch::Sender<ControlState>,
}

impl ControlHandle {
    fn new() -> Self {
        let (state, _) = watch::channel(ControlState::Running);
        Self { state }
    }

    /// 현재 제어 상태이다.
    pub fn state(&self) -> ControlState {
        *self.state.borrow()
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        self.state() == ControlState::StopRequested
    }

    fn request_pause(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ControlState::Running {
                *state = ControlState::PauseRequested;
                true
            } else {
                false
            }
        })
    }

    fn request_resume(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, ControlState::PauseRequested | ControlState::Paused) {
                *state = ControlState::Running;
                true
            } else {
                false
            }
        })
    }

    fn request_stop(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ControlState::StopRequested {
                false
            } else {
                *state = ControlState::StopRequested;
                true
            }
        })
    }

    fn acknowledge_pause(&self) {
        self.state.send_if_modified(|state| {
            if *state == ControlState::PauseRequested {
                *state = ControlState::Paused;
                true
            } else {
                false
            }
        });
    }

    /// Step 경계 검사를 수행한다. 일시 정지 중이면 재개 또는 중단될 때까지 대기한다.
    ///
    /// # 매개변수
    /// - `on_pause`: 대기에 들어가기 직전 한 번 호출된다(PAUSED 보고용).
    pub(crate) async fn checkpoint(&self, mut on_pause: impl FnMut()) -> Checkpoint {
        let mut rx = self.state.subscribe();
        let mut reported = false;
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ControlState::Running => return Checkpoint::Proceed,
                ControlState::StopRequested => return Checkpoint::Stop,
                ControlState::PauseRequested | ControlState::Paused => {
                    if !reported {
                        self.acknowledge_pause();
                        on_pause();
                        reported = true;
                    }
                    // 송신자는 self가 들고 있으므로 닫히지 않는다.
                    if rx.changed().await.is_err() {
                        return Checkpoint::Proceed;
                    }
                }
            }
        }
    }
}

/// 실행 ID별 제어 핸들을 관리한다.
#[derive(Debug)]
pub struct ExecutionManager {
    /// 다음 실행 ID를 생성하기 위한 카운터이다.
    next_id: AtomicU64,
    /// 진행 중인 실행과 제어 핸들을 매핑한다.
    handles: Mutex<HashMap<u64, Arc<ControlHandle>>>,
}

impl Default for ExecutionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// 새 실행을 등록하고 ID와 핸들을 반환한다.
    pub fn register(&self) -> (u64, Arc<ControlHandle>) {
        let execution_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ControlHandle::new());
        self.handles
            .lock()
            .expect("ExecutionManager mutex poisoned")
            .insert(execution_id, handle.clone());
        (execution_id, handle)
    }

    fn lookup(&self, execution_id: u64) -> Option<Arc<ControlHandle>> {
        self.handles
            .lock()
            .expect("ExecutionManager mutex poisoned")
            .get(&execution_id)
            .cloned()
    }

    /// 실행을 일시 정지한다. 없는 실행이면 아무 일도 하지 않고 `false`를 반환한다.
    pub fn pause_execution(&self, execution_id: u64) -> bool {
        let changed = self
            .lookup(execution_id)
            .is_some_and(|handle| handle.request_pause());
        debug!(execution_id, changed, "pause requested");
        changed
    }

    /// 일시 정지된 실행을 재개한다.
    pub fn resume_execution(&self, execution_id: u64) -> bool {
        let changed = self
            .lookup(execution_id)
            .is_some_and(|handle| handle.request_resume());
        debug!(execution_id, changed, "resume requested");
        changed
    }

    /// 실행 중단을 요청한다. 진행 중인 Step은 끝까지 실행된다.
    pub fn stop_execution(&self, execution_id: u64) -> bool {
        let changed = self
            .lookup(execution_id)
            .is_some_and(|handle| handle.request_stop());
        debug!(execution_id, changed, "stop requested");
        changed
    }

    /// 종료된 실행의 핸들을 제거한다.
    pub fn remove(&self, execution_id: u64) {
        self.handles
            .lock()
            .expect("ExecutionManager mutex poisoned")
            .remove(&execution_id);
    }

    pub fn is_active(&self, execution_id: u64) -> bool {
        self.lookup(execution_id).is_some()
    }

    pub fn state_of(&self, execution_id: u64) -> Option<ControlState> {
        self.lookup(execution_id).map(|handle| handle.state())
    }
}
