use super::value::Value;
use crate::scenario::StepDefinition;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

/// Step의 런타임 상태를 표현한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// 아직 실행되지 않음.
    NotExecuted,
    /// 실행 중.
    Running,
    /// 일시 정지 요청으로 Step 경계에서 대기 중.
    Paused,
    /// 정상 종료.
    Success,
    /// 실패.
    Failure,
    /// 중단 요청으로 종료.
    Stopped,
}

impl StepStatus {
    /// 더 이상 바뀌지 않는 상태인지 여부이다.
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Failure | StepStatus::Stopped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StepStatus::NotExecuted => "NOT_EXECUTED",
            StepStatus::Running => "RUNNING",
            StepStatus::Paused => "PAUSED",
            StepStatus::Success => "SUCCESS",
            StepStatus::Failure => "FAILURE",
            StepStatus::Stopped => "STOPPED",
        };
        f.write_str(text)
    }
}

/// 자식 상태로부터 부모 상태를 결정한다.
///
/// 실패가 하나라도 있으면 FAILURE, 실패 없이 중단이 있으면 STOPPED, 그 외에는 SUCCESS이다.
pub fn derive_parent_status(children: impl IntoIterator<Item = StepStatus>) -> StepStatus {
    let mut stopped = false;
    for status in children {
        match status {
            StepStatus::Failure => return StepStatus::Failure,
            StepStatus::Stopped => stopped = true,
            _ => {}
        }
    }
    if stopped {
        StepStatus::Stopped
    } else {
        StepStatus::Success
    }
}

/// 실행 트리의 노드 하나이다.
#[derive(Debug, Clone)]
pub struct StepNode {
    /// 하위 Step을 제외한 원본 정의.
    pub definition: StepDefinition,
    /// 현재 상태 값.
    pub status: StepStatus,
    /// 시작 시각.
    pub started_at: Option<DateTime<Utc>>,
    /// 종료 시각.
    pub finished_at: Option<DateTime<Utc>>,
    /// 평가된 입력.
    pub evaluated_inputs: IndexMap<String, Value>,
    /// 액션이 내보낸 값.
    pub outputs: IndexMap<String, Value>,
    pub errors: Vec<String>,
    pub information: Vec<String>,
    /// 원격 에이전트에서 실행되었는지 여부.
    pub remote: bool,
    /// 자식 노드 인덱스.
    pub children: Vec<usize>,
}

impl StepNode {
    fn new(definition: StepDefinition) -> Self {
        Self {
            definition,
            status: StepStatus::NotExecuted,
            started_at: None,
            finished_at: None,
            evaluated_inputs: IndexMap::new(),
            outputs: IndexMap::new(),
            errors: Vec::new(),
            information: Vec::new(),
            remote: false,
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// 정의 트리를 본뜬 노드 배열이다. 루트는 항상 0번이며 자식은 부모만 가리킨다.
#[derive(Debug, Clone)]
pub struct ExecutionTree {
    nodes: Vec<StepNode>,
}

impl ExecutionTree {
    /// 정의 트리로부터 새 실행 트리를 만든다. 모든 노드는 NOT_EXECUTED 상태이다.
    pub fn build(root: &StepDefinition) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.insert(root);
        tree
    }

    fn insert(&mut self, definition: &StepDefinition) -> usize {
        let index = self.nodes.len();
        self.nodes.push(StepNode::new(definition.shallow()));
        let children: Vec<usize> = definition
            .steps
            .iter()
            .map(|child| self.insert(child))
            .collect();
        self.nodes[index].children = children;
        index
    }

    pub const ROOT: usize = 0;

    pub fn node(&self, index: usize) -> &StepNode {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut StepNode {
        &mut self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 상태를 바꾼다. 이미 종료 상태인 노드는 바뀌지 않으며 `false`를 반환한다.
    pub fn transition(&mut self, index: usize, status: StepStatus) -> bool {
        let node = &mut self.nodes[index];
        if node.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        if status == StepStatus::Running && node.started_at.is_none() {
            node.started_at = Some(now);
        }
        if status.is_terminal() {
            node.finished_at = Some(now);
        }
        node.status = status;
        true
    }

    /// 노드와 아직 종료되지 않은 모든 자손을 STOPPED로 표시한다.
    pub fn stop_subtree(&mut self, index: usize) {
        let mut pending = vec![index];
        while let Some(current) = pending.pop() {
            self.transition(current, StepStatus::Stopped);
            pending.extend(self.nodes[current].children.iter().copied());
        }
    }

    /// 자식 상태 목록이다.
    pub fn child_statuses(&self, index: usize) -> Vec<StepStatus> {
        self.nodes[index]
            .children
            .iter()
            .map(|child| self.nodes[*child].status)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StepDefinition {
        StepDefinition::new("root").with_steps(vec![
            StepDefinition::new("a").with_steps(vec![StepDefinition::new("a1")]),
            StepDefinition::new("b"),
        ])
    }

    #[test]
    fn build_mirrors_definition_in_pre_order() {
        let tree = ExecutionTree::build(&sample());
        let names: Vec<&str> = (0..tree.len()).map(|i| tree.node(i).name()).collect();
        assert_eq!(names, vec!["root", "a", "a1", "b"]);
        assert_eq!(tree.node(ExecutionTree::ROOT).children, vec![1, 3]);
        assert_eq!(tree.node(1).children, vec![2]);
        assert!(tree.node(1).definition.steps.is_empty());
    }

    #[test]
    fn terminal_status_never_changes() {
        let mut tree = ExecutionTree::build(&sample());
        assert!(tree.transition(3, StepStatus::Running));
        assert!(tree.transition(3, StepStatus::Success));
        assert!(!tree.transition(3, StepStatus::Failure));
        assert_eq!(tree.node(3).status, StepStatus::Success);
        assert!(tree.node(3).finished_at.is_some());
    }

    #[test]
    fn stop_subtree_keeps_finished_nodes() {
        let mut tree = ExecutionTree::build(&sample());
        tree.transition(2, StepStatus::Success);
        tree.stop_subtree(ExecutionTree::ROOT);
        assert_eq!(tree.node(2).status, StepStatus::Success);
        assert_eq!(tree.node(1).status, StepStatus::Stopped);
        assert_eq!(tree.node(3).status, StepStatus::Stopped);
    }

    #[test]
    fn parent_status_follows_children() {
        use StepStatus::*;
        assert_eq!(derive_parent_status([Success, Success]), Success);
        assert_eq!(derive_parent_status([Success, Stopped]), Stopped);
        assert_eq!(derive_parent_status([Stopped, Failure]), Failure);
        assert_eq!(derive_parent_status([]), Success);
    }
}
