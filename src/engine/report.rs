use super::error::EngineError;
use super::state::{ExecutionTree, StepStatus};
use super::value::Value;
use chrono::{DateTime, Utc};
use futures::Stream;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Step 하나의 특정 시점 실행 상태이다.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionReport {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub step_type: Option<String>,
    pub status: StepStatus,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// 종료된 경우 실행 시간(ms).
    pub duration_ms: Option<i64>,
    pub evaluated_inputs: IndexMap<String, Value>,
    pub outputs: IndexMap<String, Value>,
    pub errors: Vec<String>,
    pub information: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub remote: bool,
    pub steps: Vec<StepExecutionReport>,
}

impl StepExecutionReport {
    /// 트리의 한 노드와 그 자손을 렌더링한다.
    pub fn from_tree(tree: &ExecutionTree, index: usize) -> Self {
        let node = tree.node(index);
        let duration_ms = match (node.started_at, node.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };
        Self {
            name: node.definition.name.clone(),
            step_type: node.definition.step_type.clone(),
            status: node.status,
            start_date: node.started_at,
            end_date: node.finished_at,
            duration_ms,
            evaluated_inputs: node.evaluated_inputs.clone(),
            outputs: node.outputs.clone(),
            errors: node.errors.clone(),
            information: node.information.clone(),
            target: node.definition.target.clone(),
            remote: node.remote,
            steps: node
                .children
                .iter()
                .map(|child| Self::from_tree(tree, *child))
                .collect(),
        }
    }

    /// 시작했지만 끝나지 않은 Step을 FAILURE로 닫는다. 시작하지 않은 Step은 그대로 둔다.
    fn close_unfinished(&mut self, now: DateTime<Utc>) {
        for child in &mut self.steps {
            child.close_unfinished(now);
        }
        if !self.status.is_terminal() && self.status != StepStatus::NotExecuted {
            self.status = StepStatus::Failure;
            self.end_date = Some(now);
            self.duration_ms = self.start_date.map(|start| (now - start).num_milliseconds());
        }
    }

    /// 자신과 모든 자손을 전위 순서로 방문한다.
    pub fn walk(&self) -> Vec<&StepExecutionReport> {
        let mut visited = vec![self];
        for child in &self.steps {
            visited.extend(child.walk());
        }
        visited
    }
}

/// 구독자에게 전달되는 실행 전체 스냅샷이다.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub execution_id: u64,
    pub scenario_name: String,
    pub report: StepExecutionReport,
}

impl ExecutionReport {
    pub fn status(&self) -> StepStatus {
        self.report.status
    }

    /// 루트가 종료 상태인 마지막 스냅샷인지 여부이다.
    pub fn is_terminal(&self) -> bool {
        self.report.status.is_terminal()
    }

    /// 비정상 종료된 실행의 마지막 모습이다. 진행 중이던 Step과 루트가 FAILURE가 된다.
    fn aborted(mut self, message: &str) -> Self {
        self.report.close_unfinished(Utc::now());
        self.report.status = StepStatus::Failure;
        self.report.errors.push(message.to_string());
        self
    }
}

#[derive(Debug, Clone)]
enum ReportEvent {
    Snapshot(ExecutionReport),
    Failed(EngineError),
}

/// 실행 하나의 구독자 목록과 마지막으로 보낸 스냅샷이다.
#[derive(Debug, Default)]
struct Channel {
    senders: Vec<UnboundedSender<ReportEvent>>,
    last: Option<ExecutionReport>,
}

/// 실행 ID별 구독자 목록을 관리하고 스냅샷을 다중 전송한다.
///
/// 구독자마다 무제한 채널을 두므로 느린 구독자가 실행 루프를 막지 않는다.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    subscribers: Arc<Mutex<HashMap<u64, Channel>>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 실행 ID에 대한 구독자 목록을 만든다.
    pub fn register(&self, execution_id: u64) {
        self.subscribers
            .lock()
            .expect("Reporter mutex poisoned")
            .entry(execution_id)
            .or_default();
    }

    /// 구독 시점 이후의 스냅샷을 받는 스트림을 반환한다.
    ///
    /// 등록되지 않았거나 이미 끝난 실행이면 곧바로 끝나는 스트림이다.
    pub fn subscribe(&self, execution_id: u64) -> ReportStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.subscribers.lock().expect("Reporter mutex poisoned");
        if let Some(channel) = guard.get_mut(&execution_id) {
            channel.senders.push(tx);
        }
        ReportStream {
            receiver: rx,
            finished: false,
        }
    }

    /// 현재 구독자 모두에게 스냅샷을 보낸다. 닫힌 구독자는 정리한다.
    pub fn publish(&self, report: ExecutionReport) {
        let execution_id = report.execution_id;
        let mut guard = self.subscribers.lock().expect("Reporter mutex poisoned");
        if let Some(channel) = guard.get_mut(&execution_id) {
            channel
                .senders
                .retain(|tx| tx.send(ReportEvent::Snapshot(report.clone())).is_ok());
            channel.last = Some(report);
        }
    }

    /// 정상 종료: 구독자 목록을 제거해 모든 스트림을 닫는다.
    pub fn complete(&self, execution_id: u64) {
        let removed = self
            .subscribers
            .lock()
            .expect("Reporter mutex poisoned")
            .remove(&execution_id);
        debug!(
            execution_id,
            subscribers = removed.map(|channel| channel.senders.len()).unwrap_or(0),
            "report stream completed"
        );
    }

    /// 비정상 종료: 루트가 FAILURE인 오류 스냅샷과 오류를 한 번씩 전달한 뒤 스트림을 닫는다.
    ///
    /// 아직 스냅샷을 보낸 적이 없으면 오류만 전달한다.
    pub fn fail(&self, execution_id: u64, error: EngineError) {
        let removed = self
            .subscribers
            .lock()
            .expect("Reporter mutex poisoned")
            .remove(&execution_id);
        let Some(channel) = removed else {
            return;
        };
        let message = error.to_string();
        let aborted = channel.last.map(|report| report.aborted(&message));
        for tx in channel.senders {
            if let Some(report) = &aborted {
                let _ = tx.send(ReportEvent::Snapshot(report.clone()));
            }
            let _ = tx.send(ReportEvent::Failed(error.clone()));
        }
    }

    pub fn subscriber_count(&self, execution_id: u64) -> usize {
        self.subscribers
            .lock()
            .expect("Reporter mutex poisoned")
            .get(&execution_id)
            .map(|channel| channel.senders.len())
            .unwrap_or(0)
    }

    pub fn is_registered(&self, execution_id: u64) -> bool {
        self.subscribers
            .lock()
            .expect("Reporter mutex poisoned")
            .contains_key(&execution_id)
    }
}

/// 실행 하나의 스냅샷 스트림이다. 엔진 오류가 전달되면 그 뒤로는 끝난다.
#[derive(Debug)]
pub struct ReportStream {
    receiver: UnboundedReceiver<ReportEvent>,
    finished: bool,
}

impl ReportStream {
    /// 남은 스냅샷을 모두 받아 마지막 것을 반환한다.
    pub async fn last(mut self) -> Result<Option<ExecutionReport>, EngineError> {
        use futures::StreamExt;
        let mut last = None;
        while let Some(item) = self.next().await {
            last = Some(item?);
        }
        Ok(last)
    }
}

impl Stream for ReportStream {
    type Item = Result<ExecutionReport, EngineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(ReportEvent::Snapshot(report))) => Poll::Ready(Some(Ok(report))),
            Poll::Ready(Some(ReportEvent::Failed(error))) => {
                self.finished = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::StepDefinition;
    use futures::StreamExt;

    fn snapshot(execution_id: u64, status: StepStatus) -> ExecutionReport {
        let mut tree = ExecutionTree::build(&StepDefinition::new("root"));
        tree.transition(ExecutionTree::ROOT, status);
        ExecutionReport {
            execution_id,
            scenario_name: "root".into(),
            report: StepExecutionReport::from_tree(&tree, ExecutionTree::ROOT),
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives_the_same_sequence() {
        let reporter = Reporter::new();
        reporter.register(7);
        let first = reporter.subscribe(7);
        let second = reporter.subscribe(7);

        reporter.publish(snapshot(7, StepStatus::Running));
        reporter.publish(snapshot(7, StepStatus::Success));
        reporter.complete(7);

        let a: Vec<_> = first.map(|r| r.expect("snapshot").status()).collect().await;
        let b: Vec<_> = second.map(|r| r.expect("snapshot").status()).collect().await;
        assert_eq!(a, vec![StepStatus::Running, StepStatus::Success]);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_history() {
        let reporter = Reporter::new();
        reporter.register(1);
        reporter.publish(snapshot(1, StepStatus::Running));
        let late = reporter.subscribe(1);
        reporter.publish(snapshot(1, StepStatus::Success));
        reporter.complete(1);

        let seen: Vec<_> = late.map(|r| r.expect("snapshot").status()).collect().await;
        assert_eq!(seen, vec![StepStatus::Success]);
    }

    #[tokio::test]
    async fn unknown_execution_yields_empty_stream() {
        let reporter = Reporter::new();
        let stream = reporter.subscribe(99);
        assert_eq!(stream.last().await.expect("no error"), None);
    }

    #[tokio::test]
    async fn failure_is_delivered_once_then_stream_ends() {
        let reporter = Reporter::new();
        reporter.register(3);
        let mut stream = reporter.subscribe(3);
        reporter.fail(3, EngineError::Internal("boom".into()));

        assert!(matches!(stream.next().await, Some(Err(EngineError::Internal(_)))));
        assert!(stream.next().await.is_none());
        assert!(!reporter.is_registered(3));
    }

    #[tokio::test]
    async fn failure_after_progress_sends_error_snapshot_first() {
        let reporter = Reporter::new();
        reporter.register(4);
        let mut stream = reporter.subscribe(4);
        let mut tree = ExecutionTree::build(
            &StepDefinition::new("root").with_steps(vec![
                StepDefinition::new("running"),
                StepDefinition::new("pending"),
            ]),
        );
        tree.transition(ExecutionTree::ROOT, StepStatus::Running);
        tree.transition(1, StepStatus::Running);
        reporter.publish(ExecutionReport {
            execution_id: 4,
            scenario_name: "root".into(),
            report: StepExecutionReport::from_tree(&tree, ExecutionTree::ROOT),
        });
        reporter.fail(4, EngineError::Internal("boom".into()));

        let running = stream.next().await.expect("진행 스냅샷").expect("정상");
        assert_eq!(running.status(), StepStatus::Running);
        let aborted = stream.next().await.expect("오류 스냅샷").expect("정상");
        assert_eq!(aborted.status(), StepStatus::Failure);
        assert!(aborted.report.errors[0].contains("boom"));
        assert_eq!(aborted.report.steps[0].status, StepStatus::Failure);
        assert!(aborted.report.steps[0].end_date.is_some());
        assert_eq!(aborted.report.steps[1].status, StepStatus::NotExecuted);
        assert!(matches!(stream.next().await, Some(Err(EngineError::Internal(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let reporter = Reporter::new();
        reporter.register(5);
        drop(reporter.subscribe(5));
        let _kept = reporter.subscribe(5);
        reporter.publish(snapshot(5, StepStatus::Running));
        assert_eq!(reporter.subscriber_count(5), 1);
    }
}
