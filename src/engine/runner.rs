use super::context::ScenarioContext;
use super::control::{Checkpoint, ControlHandle};
use super::evaluation::Evaluator;
use super::report::{ExecutionReport, Reporter, StepExecutionReport};
use super::state::{ExecutionTree, StepStatus, derive_parent_status};
use super::steps::{ActionInput, ActionOutcome, ActionRegistry, ActionStatus, SharedAction};
use super::value::Value;
use crate::config::{EngineConfig, FailurePolicy};
use crate::delegation::{DelegationGateway, RemoteExecution};
use crate::scenario::{StepStrategy, Target};
use futures::future::BoxFuture;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// 실행 하나에 필요한 공유 자원 묶음이다.
pub(crate) struct StepRunner {
    pub execution_id: u64,
    pub scenario_name: String,
    pub actions: Arc<ActionRegistry>,
    pub evaluator: Arc<Evaluator>,
    pub gateway: DelegationGateway,
    pub reporter: Reporter,
    pub control: Arc<ControlHandle>,
    pub config: EngineConfig,
    /// 이름으로 찾는 대상 목록.
    pub targets: IndexMap<String, Target>,
}

/// 액션 단계의 결과이다.
struct ActionResult {
    outcome: ActionOutcome,
    fatal: bool,
}

impl StepRunner {
    /// 트리 전체를 깊이 우선 전위 순서로 실행하고 루트 상태를 반환한다.
    pub async fn run(&self, tree: &mut ExecutionTree, ctx: &mut ScenarioContext) -> StepStatus {
        let mut halted = false;
        self.run_node(tree, ctx, ExecutionTree::ROOT, &mut halted)
            .await;
        let status = tree.node(ExecutionTree::ROOT).status;
        info!(
            execution_id = self.execution_id,
            scenario = %self.scenario_name,
            %status,
            "scenario finished"
        );
        status
    }

    /// 현재 트리를 스냅샷으로 만들어 구독자에게 보낸다.
    fn publish(&self, tree: &ExecutionTree) {
        self.reporter.publish(ExecutionReport {
            execution_id: self.execution_id,
            scenario_name: self.scenario_name.clone(),
            report: StepExecutionReport::from_tree(tree, ExecutionTree::ROOT),
        });
    }

    fn finish(&self, tree: &mut ExecutionTree, index: usize, status: StepStatus) {
        tree.transition(index, status);
        debug!(
            execution_id = self.execution_id,
            step = %tree.node(index).name(),
            %status,
            "step finished"
        );
        self.publish(tree);
    }

    /// 노드 하나와 그 자손을 실행한다.
    ///
    /// 실패 정책으로 실행이 멈추면 `halted`가 설정되고, 이후 노드는 NOT_EXECUTED로 남는다.
    fn run_node<'a>(
        &'a self,
        tree: &'a mut ExecutionTree,
        ctx: &'a mut ScenarioContext,
        index: usize,
        halted: &'a mut bool,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if *halted {
                return;
            }
            let decision = self
                .control
                .checkpoint(|| {
                    tree.transition(index, StepStatus::Paused);
                    self.publish(tree);
                })
                .await;
            if decision == Checkpoint::Stop {
                tree.stop_subtree(index);
                self.publish(tree);
                return;
            }

            tree.transition(index, StepStatus::Running);
            self.publish(tree);

            let definition = tree.node(index).definition.clone();
            let mut action_failed = false;
            let mut fatal = false;
            match self.evaluator.evaluate_named(&definition.inputs, ctx) {
                Ok(inputs) => {
                    tree.node_mut(index).evaluated_inputs = inputs.clone();
                    if let Some(step_type) = definition.step_type.as_deref() {
                        let ActionResult {
                            outcome,
                            fatal: action_fatal,
                        } = self.run_action(tree, ctx, index, step_type, inputs).await;
                        let succeeded = outcome.is_success();
                        let node = tree.node_mut(index);
                        node.errors.extend(outcome.errors);
                        node.information.extend(outcome.information);
                        if !succeeded {
                            action_failed = true;
                            fatal = action_fatal;
                        }
                    }
                }
                Err(err) => {
                    warn!(step = %definition.name, error = %err, "input evaluation failed");
                    tree.node_mut(index).errors.push(err.to_string());
                    action_failed = true;
                }
            }

            if !action_failed {
                let children = tree.node(index).children.clone();
                for child in children {
                    if *halted {
                        break;
                    }
                    self.run_node(&mut *tree, &mut *ctx, child, &mut *halted)
                        .await;
                }
            }

            let status = if action_failed {
                StepStatus::Failure
            } else {
                derive_parent_status(tree.child_statuses(index))
            };
            self.finish(tree, index, status);

            if status == StepStatus::Failure
                && (fatal || self.config.failure_policy == FailurePolicy::Stop)
            {
                *halted = true;
            }
        })
    }

    /// 평가된 입력으로 액션을 실행(로컬 또는 위임)하고 출력 게시와 검증을 수행한다.
    async fn run_action(
        &self,
        tree: &mut ExecutionTree,
        ctx: &mut ScenarioContext,
        index: usize,
        step_type: &str,
        inputs: IndexMap<String, Value>,
    ) -> ActionResult {
        let definition = tree.node(index).definition.clone();
        let step_name = definition.name.clone();

        let target = match self.resolve_target(definition.target.as_deref()) {
            Ok(target) => target,
            Err(message) => {
                return ActionResult {
                    outcome: ActionOutcome::failure(message),
                    fatal: false,
                };
            }
        };

        let input = ActionInput {
            step_name: step_name.clone(),
            inputs,
            target: target.clone(),
            context: ctx.snapshot(),
        };

        let result = match &target.agent {
            Some(agent) => {
                tree.node_mut(index).remote = true;
                let request = RemoteExecution {
                    step_type: step_type.to_string(),
                    input,
                };
                let outcome = match self.gateway.delegate(agent, request).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!(step = %step_name, error = %err, "delegation failed");
                        ActionOutcome::failure(err.to_string())
                    }
                };
                ActionResult {
                    outcome,
                    fatal: false,
                }
            }
            None => match self.actions.get(step_type) {
                Some(action) => {
                    let fatal = action.fatal_on_failure();
                    ActionResult {
                        outcome: self
                            .run_with_strategy(action, input, &definition.strategy)
                            .await,
                        fatal,
                    }
                }
                None => ActionResult {
                    outcome: ActionOutcome::failure(format!(
                        "알 수 없는 Step 종류입니다: {step_type}"
                    )),
                    fatal: false,
                },
            },
        };

        if !result.outcome.is_success() {
            return result;
        }
        let ActionResult { mut outcome, fatal } = result;

        ctx.put_all(outcome.outputs.clone());
        let mut published = outcome.outputs.clone();
        if !definition.outputs.is_empty() {
            match self.evaluator.evaluate_named_with_scope(
                &definition.outputs,
                ctx,
                Some(&outcome.outputs),
            )
            {
                Ok(mapped) => {
                    ctx.put_all(mapped.clone());
                    published.extend(mapped);
                }
                Err(err) => {
                    outcome.status = ActionStatus::Failure;
                    outcome.errors.push(err.to_string());
                }
            }
        }
        tree.node_mut(index).outputs = published.clone();

        if outcome.is_success() && !definition.validations.is_empty() {
            self.validate(&definition.validations, ctx, &published, &mut outcome);
        }
        ActionResult { outcome, fatal }
    }

    /// 검증식을 평가해 모두 참인지 확인한다.
    fn validate(
        &self,
        validations: &IndexMap<String, Value>,
        ctx: &ScenarioContext,
        scope: &IndexMap<String, Value>,
        outcome: &mut ActionOutcome,
    ) {
        let evaluated = match self
            .evaluator
            .evaluate_named_with_scope(validations, ctx, Some(scope))
        {
            Ok(evaluated) => evaluated,
            Err(err) => {
                outcome.status = ActionStatus::Failure;
                outcome.errors.push(err.to_string());
                return;
            }
        };
        for (name, value) in evaluated {
            if value == Value::Bool(true) {
                outcome.information.push(format!("Validation [{name}] : OK"));
            } else {
                outcome.status = ActionStatus::Failure;
                outcome
                    .errors
                    .push(format!("Validation [{name}] : KO ({value})"));
            }
        }
    }

    fn resolve_target(&self, name: Option<&str>) -> Result<Target, String> {
        match name.map(str::trim).filter(|name| !name.is_empty()) {
            None => Ok(Target::none()),
            Some(name) => self
                .targets
                .get(name)
                .cloned()
                .ok_or_else(|| format!("알 수 없는 대상입니다: {name}")),
        }
    }

    /// 재시도/시간 제한 전략에 따라 로컬 액션을 실행한다.
    ///
    /// 재시도 대기 시간은 기본 지연에서 시작해 시도마다 두 배가 된다.
    async fn run_with_strategy(
        &self,
        action: SharedAction,
        input: ActionInput,
        strategy: &StepStrategy,
    ) -> ActionOutcome {
        let timeout_duration = strategy
            .timeout_ms
            .map(|ms| Duration::from_millis(ms.max(1)))
            .unwrap_or_else(|| self.config.step_timeout());
        let base_delay = strategy
            .retry_delay_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.retry_base_delay());
        let mut notes: Vec<String> = Vec::new();
        let mut attempt: u32 = 0;
        loop {
            let backoff = base_delay.saturating_mul(2_u32.saturating_pow(attempt));
            let result = tokio::time::timeout(timeout_duration, action.execute(input.clone())).await;
            let mut failed = match result {
                Ok(Ok(mut outcome)) if outcome.is_success() => {
                    notes.append(&mut outcome.information);
                    outcome.information = notes;
                    return outcome;
                }
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => ActionOutcome::failure(format!("실패: {err:#}")),
                Err(_) => ActionOutcome::failure(format!(
                    "시간 초과 ({}ms)",
                    timeout_duration.as_millis()
                )),
            };
            attempt += 1;
            if attempt > strategy.retry || self.control.is_stop_requested() {
                notes.append(&mut failed.information);
                failed.information = notes;
                return failed;
            }
            warn!(
                step = %input.step_name,
                attempt,
                "step failed, retrying in {}ms",
                backoff.as_millis()
            );
            notes.push(format!(
                "{}번째 시도 실패, {}ms 후 재시도",
                attempt,
                backoff.as_millis()
            ));
            sleep(backoff).await;
        }
    }
}
