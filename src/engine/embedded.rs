use super::context::ScenarioContext;
use super::control::{ControlHandle, ExecutionManager};
use super::error::EngineError;
use super::evaluation::Evaluator;
use super::report::{ExecutionReport, ReportStream, Reporter};
use super::runner::StepRunner;
use super::state::ExecutionTree;
use super::steps::ActionRegistry;
use crate::config::EngineConfig;
use crate::delegation::{
    DelegationClient, DelegationGateway, TcpConnectionChecker, UnconfiguredDelegationClient,
};
use crate::scenario::ExecutionRequest;
use std::any::Any;
use std::sync::Arc;
use tracing::{error, info};

/// 프로세스 내에서 시나리오를 실행하는 엔진 진입점이다.
///
/// 실행마다 별도의 tokio 태스크를 띄우므로 tokio 런타임 안에서 호출해야 한다.
#[derive(Debug, Clone)]
pub struct EmbeddedEngine {
    manager: Arc<ExecutionManager>,
    reporter: Reporter,
    actions: Arc<ActionRegistry>,
    evaluator: Arc<Evaluator>,
    gateway: DelegationGateway,
    config: EngineConfig,
}

impl Default for EmbeddedEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl EmbeddedEngine {
    /// 기본 액션과 도우미 함수로 엔진을 생성한다.
    pub fn new(config: EngineConfig) -> Self {
        let gateway = DelegationGateway::new(
            Arc::new(TcpConnectionChecker::new(config.connect_timeout())),
            Arc::new(UnconfiguredDelegationClient),
            config.delegation_timeout(),
        );
        Self {
            manager: Arc::new(ExecutionManager::new()),
            reporter: Reporter::new(),
            actions: Arc::new(ActionRegistry::with_defaults()),
            evaluator: Arc::new(Evaluator::default()),
            gateway,
            config,
        }
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = Arc::new(actions);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = Arc::new(evaluator);
        self
    }

    /// 원격 실행 클라이언트를 교체한다. 연결 확인은 TCP 방식을 유지한다.
    pub fn with_delegation_client(mut self, client: Arc<dyn DelegationClient>) -> Self {
        self.gateway = DelegationGateway::new(
            Arc::new(TcpConnectionChecker::new(self.config.connect_timeout())),
            client,
            self.config.delegation_timeout(),
        );
        self
    }

    pub fn with_gateway(mut self, gateway: DelegationGateway) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 비동기로 실행을 시작하고 즉시 실행 ID를 반환한다.
    pub fn execute(&self, request: ExecutionRequest) -> u64 {
        let (execution_id, control) = self.manager.register();
        self.reporter.register(execution_id);
        self.spawn(execution_id, control, request);
        execution_id
    }

    /// 실행을 시작하기 전에 구독해 첫 스냅샷부터 받는 스트림과 함께 실행 ID를 반환한다.
    pub fn execute_observed(&self, request: ExecutionRequest) -> (u64, ReportStream) {
        let (execution_id, control) = self.manager.register();
        self.reporter.register(execution_id);
        let stream = self.reporter.subscribe(execution_id);
        self.spawn(execution_id, control, request);
        (execution_id, stream)
    }

    /// 실행이 끝날 때까지 기다려 마지막 스냅샷을 반환한다.
    pub async fn execute_sync(&self, request: ExecutionRequest) -> Result<ExecutionReport, EngineError> {
        let (execution_id, stream) = self.execute_observed(request);
        stream
            .last()
            .await?
            .ok_or(EngineError::NoReport(execution_id))
    }

    /// 실행의 이후 스냅샷 스트림을 반환한다. 모르는 ID면 빈 스트림이다.
    pub fn subscribe(&self, execution_id: u64) -> ReportStream {
        self.reporter.subscribe(execution_id)
    }

    pub fn pause(&self, execution_id: u64) -> bool {
        self.manager.pause_execution(execution_id)
    }

    pub fn resume(&self, execution_id: u64) -> bool {
        self.manager.resume_execution(execution_id)
    }

    pub fn stop(&self, execution_id: u64) -> bool {
        self.manager.stop_execution(execution_id)
    }

    pub fn is_running(&self, execution_id: u64) -> bool {
        self.manager.is_active(execution_id)
    }

    fn spawn(
        &self,
        execution_id: u64,
        control: Arc<ControlHandle>,
        request: ExecutionRequest,
    ) {
        let runner = StepRunner {
            execution_id,
            scenario_name: request.scenario.name.clone(),
            actions: self.actions.clone(),
            evaluator: self.evaluator.clone(),
            gateway: self.gateway.clone(),
            reporter: self.reporter.clone(),
            control,
            config: self.config.clone(),
            targets: request
                .targets
                .iter()
                .map(|target| (target.name.clone(), target.clone()))
                .collect(),
        };
        let mut tree = ExecutionTree::build(&request.scenario);
        let mut ctx = ScenarioContext::from_variables(&request.variables, &request.dataset);
        info!(
            execution_id,
            scenario = %runner.scenario_name,
            steps = tree.len(),
            "execution started"
        );

        let task = tokio::spawn(async move { runner.run(&mut tree, &mut ctx).await });
        let manager = self.manager.clone();
        let reporter = self.reporter.clone();
        tokio::spawn(async move {
            let outcome = task.await;
            manager.remove(execution_id);
            match outcome {
                Ok(_) => reporter.complete(execution_id),
                Err(join_err) => {
                    let message = if join_err.is_panic() {
                        panic_message(join_err.into_panic())
                    } else {
                        join_err.to_string()
                    };
                    error!(execution_id, %message, "execution aborted");
                    reporter.fail(
                        execution_id,
                        EngineError::Aborted {
                            execution_id,
                            message,
                        },
                    );
                }
            }
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "알 수 없는 panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailurePolicy;
    use crate::engine::StepStatus;
    use crate::engine::report::StepExecutionReport;
    use crate::engine::steps::testing::RecordingAction;
    use crate::engine::steps::{ActionInput, ActionOutcome, StepAction};
    use crate::engine::Value;
    use crate::scenario::StepDefinition;
    use async_trait::async_trait;
    use futures::StreamExt;
    use indexmap::IndexMap;

    fn engine_with(recorder: &RecordingAction) -> EmbeddedEngine {
        let mut actions = ActionRegistry::with_defaults();
        actions.register(Arc::new(recorder.clone()));
        EmbeddedEngine::default().with_actions(actions)
    }

    fn scenario(steps: Vec<StepDefinition>) -> ExecutionRequest {
        ExecutionRequest::new(StepDefinition::new("scenario").with_steps(steps))
    }

    fn statuses(report: &StepExecutionReport) -> Vec<(String, StepStatus)> {
        report
            .walk()
            .into_iter()
            .map(|step| (step.name.clone(), step.status))
            .collect()
    }

    #[tokio::test]
    async fn root_succeeds_only_when_every_step_succeeds() {
        let recorder = RecordingAction::new("record", ActionOutcome::success());
        let engine = engine_with(&recorder);
        let report = engine
            .execute_sync(scenario(vec![
                StepDefinition::new("group").with_steps(vec![
                    StepDefinition::new("a").with_type("record"),
                    StepDefinition::new("b").with_type("record"),
                ]),
                StepDefinition::new("c").with_type("record"),
            ]))
            .await
            .expect("실행 보고서");

        assert_eq!(report.status(), StepStatus::Success);
        assert!(
            statuses(&report.report)
                .iter()
                .all(|(_, status)| *status == StepStatus::Success)
        );
        assert_eq!(recorder.calls().await, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn failure_propagates_but_siblings_still_run() {
        let recorder = RecordingAction::new("record", ActionOutcome::success());
        let engine = engine_with(&recorder);
        let report = engine
            .execute_sync(scenario(vec![
                StepDefinition::new("broken").with_type("fail"),
                StepDefinition::new("after").with_type("record"),
            ]))
            .await
            .expect("실행 보고서");

        assert_eq!(report.status(), StepStatus::Failure);
        assert_eq!(report.report.steps[0].status, StepStatus::Failure);
        assert_eq!(report.report.steps[1].status, StepStatus::Success);
        assert_eq!(recorder.calls().await, vec!["after"]);
    }

    #[tokio::test]
    async fn stop_on_failure_leaves_rest_not_executed() {
        let recorder = RecordingAction::new("record", ActionOutcome::success());
        let config = EngineConfig::default().with_failure_policy(FailurePolicy::Stop);
        let mut actions = ActionRegistry::with_defaults();
        actions.register(Arc::new(recorder.clone()));
        let engine = EmbeddedEngine::new(config).with_actions(actions);
        let report = engine
            .execute_sync(scenario(vec![
                StepDefinition::new("broken").with_type("fail"),
                StepDefinition::new("after").with_type("record"),
            ]))
            .await
            .expect("실행 보고서");

        assert_eq!(report.status(), StepStatus::Failure);
        assert_eq!(report.report.steps[1].status, StepStatus::NotExecuted);
        assert!(recorder.calls().await.is_empty());
    }

    #[tokio::test]
    async fn stop_before_start_stops_everything() {
        let recorder = RecordingAction::new("record", ActionOutcome::success());
        let engine = engine_with(&recorder);
        let (id, stream) = engine.execute_observed(scenario(vec![
            StepDefinition::new("a").with_type("record"),
            StepDefinition::new("b").with_steps(vec![StepDefinition::new("b1").with_type("record")]),
        ]));
        assert!(engine.stop(id));

        let last = stream.last().await.expect("스트림").expect("스냅샷");
        assert_eq!(last.status(), StepStatus::Stopped);
        assert!(
            statuses(&last.report)
                .iter()
                .all(|(_, status)| *status == StepStatus::Stopped)
        );
        assert!(recorder.calls().await.is_empty());
        assert!(!engine.is_running(id));
    }

    #[tokio::test]
    async fn pause_then_resume_runs_each_step_once() {
        let recorder = RecordingAction::new("record", ActionOutcome::success());
        let engine = engine_with(&recorder);
        let (id, mut stream) = engine.execute_observed(scenario(vec![
            StepDefinition::new("a").with_type("record"),
            StepDefinition::new("b").with_type("record"),
        ]));
        assert!(engine.pause(id));

        let first = stream.next().await.expect("스냅샷").expect("정상");
        assert_eq!(first.status(), StepStatus::Paused);
        assert!(recorder.calls().await.is_empty());

        assert!(engine.resume(id));
        let mut seen = vec![first];
        while let Some(item) = stream.next().await {
            seen.push(item.expect("정상"));
        }
        let last = seen.last().expect("마지막 스냅샷");
        assert_eq!(last.status(), StepStatus::Success);
        assert_eq!(
            seen.iter().filter(|report| report.is_terminal()).count(),
            1,
            "종료 스냅샷은 마지막 하나뿐이어야 한다"
        );
        assert_eq!(recorder.calls().await, vec!["a", "b"]);
    }

    fn step_status(report: &ExecutionReport, index: usize) -> StepStatus {
        report.report.steps[index].status
    }

    #[tokio::test]
    async fn pause_mid_tree_halts_at_next_step_and_resumes_there() {
        let recorder = RecordingAction::new("record", ActionOutcome::success());
        let engine = engine_with(&recorder);
        let (id, mut stream) = engine.execute_observed(scenario(vec![
            StepDefinition::new("wait")
                .with_type("sleep")
                .with_input("duration", "150ms"),
            StepDefinition::new("b").with_type("record"),
            StepDefinition::new("c").with_type("record"),
        ]));

        loop {
            let report = stream.next().await.expect("스냅샷").expect("정상");
            if step_status(&report, 0) == StepStatus::Running {
                break;
            }
        }
        assert!(engine.pause(id));

        let paused = loop {
            let report = stream.next().await.expect("스냅샷").expect("정상");
            if step_status(&report, 1) == StepStatus::Paused {
                break report;
            }
        };
        assert_eq!(step_status(&paused, 0), StepStatus::Success);
        assert_eq!(step_status(&paused, 2), StepStatus::NotExecuted);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(recorder.calls().await.is_empty());

        assert!(engine.resume(id));
        let last = stream.last().await.expect("스트림").expect("스냅샷");
        assert_eq!(last.status(), StepStatus::Success);
        assert_eq!(recorder.calls().await, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn stopping_one_execution_leaves_the_other_running() {
        let recorder = RecordingAction::new("record", ActionOutcome::success());
        let engine = engine_with(&recorder);
        let request = |name: &str| {
            scenario(vec![
                StepDefinition::new("wait")
                    .with_type("sleep")
                    .with_input("duration", "100ms"),
                StepDefinition::new(name).with_type("record"),
            ])
        };
        let (stopped_id, stopped_stream) = engine.execute_observed(request("stopped-after"));
        let (kept_id, kept_stream) = engine.execute_observed(request("kept-after"));
        assert_ne!(stopped_id, kept_id);
        assert!(engine.is_running(stopped_id));
        assert!(engine.is_running(kept_id));
        assert!(engine.stop(stopped_id));

        let (stopped, kept) = tokio::join!(stopped_stream.last(), kept_stream.last());
        let stopped = stopped.expect("스트림").expect("스냅샷");
        let kept = kept.expect("스트림").expect("스냅샷");
        assert_eq!(stopped.status(), StepStatus::Stopped);
        assert_eq!(kept.status(), StepStatus::Success);
        assert_eq!(recorder.calls().await, vec!["kept-after"]);
        assert!(!engine.is_running(stopped_id));
        assert!(!engine.is_running(kept_id));
    }

    #[tokio::test]
    async fn stop_while_paused_ends_stopped() {
        let recorder = RecordingAction::new("record", ActionOutcome::success());
        let engine = engine_with(&recorder);
        let (id, mut stream) =
            engine.execute_observed(scenario(vec![StepDefinition::new("a").with_type("record")]));
        engine.pause(id);

        let first = stream.next().await.expect("스냅샷").expect("정상");
        assert_eq!(first.status(), StepStatus::Paused);
        engine.stop(id);

        let last = stream.last().await.expect("스트림").expect("스냅샷");
        assert_eq!(last.status(), StepStatus::Stopped);
        assert!(recorder.calls().await.is_empty());
    }

    #[tokio::test]
    async fn subscribers_observe_identical_sequences() {
        let recorder = RecordingAction::new("record", ActionOutcome::success());
        let engine = engine_with(&recorder);
        let (id, first) = engine.execute_observed(scenario(vec![
            StepDefinition::new("a").with_type("record"),
            StepDefinition::new("b").with_type("fail"),
        ]));
        let second = engine.subscribe(id);

        let a: Vec<ExecutionReport> = first.map(|item| item.expect("정상")).collect().await;
        let b: Vec<ExecutionReport> = second.map(|item| item.expect("정상")).collect().await;
        assert!(!a.is_empty());
        assert_eq!(a, b);
        assert_eq!(a.last().map(ExecutionReport::status), Some(StepStatus::Failure));
    }

    #[tokio::test]
    async fn evaluation_failure_is_scoped_to_its_step() {
        let recorder = RecordingAction::new("record", ActionOutcome::success());
        let engine = engine_with(&recorder);
        let report = engine
            .execute_sync(scenario(vec![
                StepDefinition::new("bad")
                    .with_type("record")
                    .with_input("value", "${#missing}"),
                StepDefinition::new("evil")
                    .with_type("record")
                    .with_input("value", "${T(java.lang.Runtime).getRuntime().exec('ls')}"),
                StepDefinition::new("good").with_type("record"),
            ]))
            .await
            .expect("실행 보고서");

        assert_eq!(report.status(), StepStatus::Failure);
        assert_eq!(report.report.steps[0].status, StepStatus::Failure);
        assert_eq!(report.report.steps[1].status, StepStatus::Failure);
        assert_eq!(report.report.steps[2].status, StepStatus::Success);
        assert_eq!(recorder.calls().await, vec!["good"]);
    }

    #[tokio::test]
    async fn context_flows_between_steps() {
        let engine = EmbeddedEngine::default();
        let entries = IndexMap::from([("user".to_string(), Value::from("kim"))]);
        let request = scenario(vec![
            StepDefinition::new("put")
                .with_type("context-put")
                .with_input("entries", Value::from_named(&entries)),
            StepDefinition::new("check")
                .with_type("compare")
                .with_input("actual", "${#user}")
                .with_input("expected", "${#expected}"),
        ])
        .with_variable("expected", "lee")
        .with_dataset(IndexMap::from([("expected".to_string(), Value::from("kim"))]));

        let report = engine.execute_sync(request).await.expect("실행 보고서");
        assert_eq!(report.status(), StepStatus::Success);
        assert_eq!(
            report.report.steps[1].evaluated_inputs.get("actual"),
            Some(&Value::from("kim"))
        );
    }

    #[tokio::test]
    async fn empty_scenario_succeeds() {
        let engine = EmbeddedEngine::default();
        let report = engine.execute_sync(scenario(Vec::new())).await.expect("실행 보고서");
        assert_eq!(report.status(), StepStatus::Success);
    }

    /// 실행 중 panic을 일으키는 액션이다.
    struct PanickingAction;

    #[async_trait]
    impl StepAction for PanickingAction {
        fn step_type(&self) -> &str {
            "panic"
        }

        async fn execute(&self, _input: ActionInput) -> anyhow::Result<ActionOutcome> {
            panic!("액션 내부 오류");
        }
    }

    #[tokio::test]
    async fn panic_surfaces_as_stream_error_and_engine_survives() {
        let mut actions = ActionRegistry::with_defaults();
        actions.register(Arc::new(PanickingAction));
        let engine = EmbeddedEngine::default().with_actions(actions);

        let (_, stream) =
            engine.execute_observed(scenario(vec![StepDefinition::new("boom").with_type("panic")]));
        let items: Vec<_> = stream.collect().await;
        let (last, snapshots) = items.split_last().expect("스트림 항목");
        match last {
            Err(EngineError::Aborted { message, .. }) => {
                assert!(message.contains("액션 내부 오류"))
            }
            other => panic!("예상하지 못한 항목: {other:?}"),
        }
        let aborted = snapshots
            .last()
            .expect("오류 스냅샷")
            .as_ref()
            .expect("정상 스냅샷");
        assert_eq!(aborted.status(), StepStatus::Failure);
        assert_eq!(aborted.report.steps[0].status, StepStatus::Failure);
        assert!(aborted.report.errors[0].contains("액션 내부 오류"));

        let report = engine
            .execute_sync(scenario(vec![StepDefinition::new("ok").with_type("success")]))
            .await
            .expect("다음 실행");
        assert_eq!(report.status(), StepStatus::Success);
    }

    #[tokio::test]
    async fn unknown_execution_ids_are_ignored() {
        let engine = EmbeddedEngine::default();
        assert!(!engine.pause(404));
        assert!(!engine.resume(404));
        assert!(!engine.stop(404));
        assert!(engine.subscribe(404).last().await.expect("빈 스트림").is_none());
    }

    #[tokio::test]
    async fn execution_ids_are_unique() {
        let engine = EmbeddedEngine::default();
        let first = engine.execute(scenario(Vec::new()));
        let second = engine.execute(scenario(Vec::new()));
        assert_ne!(first, second);
    }
}
