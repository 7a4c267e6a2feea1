use crate::engine::{ActionInput, ActionOutcome};
use crate::scenario::NamedHostAndPort;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod tcp;

pub use tcp::TcpConnectionChecker;

/// 에이전트 도달 가능 여부를 확인하는 추상 계층이다.
#[async_trait]
pub trait ConnectionChecker: Send + Sync {
    /// 연결 가능하면 `true`. 실패는 오류가 아니라 `false`로 보고한다.
    async fn can_connect_to(&self, agent: &NamedHostAndPort) -> bool;
}

/// 원격 에이전트에 넘기는 Step 실행 요청이다.
#[derive(Debug, Clone)]
pub struct RemoteExecution {
    pub step_type: String,
    pub input: ActionInput,
}

/// 원격 에이전트와 통신하는 와이어 프로토콜 경계이다.
#[async_trait]
pub trait DelegationClient: Send + Sync {
    async fn execute(
        &self,
        agent: &NamedHostAndPort,
        request: RemoteExecution,
    ) -> anyhow::Result<ActionOutcome>;
}

/// 원격 프로토콜이 구성되지 않았을 때 쓰는 기본 클라이언트이다.
#[derive(Debug, Default, Clone)]
pub struct UnconfiguredDelegationClient;

#[async_trait]
impl DelegationClient for UnconfiguredDelegationClient {
    async fn execute(
        &self,
        agent: &NamedHostAndPort,
        request: RemoteExecution,
    ) -> anyhow::Result<ActionOutcome> {
        anyhow::bail!(
            "원격 실행 클라이언트가 구성되지 않아 Step '{}'을(를) {}에 위임할 수 없습니다.",
            request.input.step_name,
            agent
        )
    }
}

/// 위임 실패 원인이다.
#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    /// TCP 연결 확인에 실패한 경우이다. 원격 호출은 시도하지 않는다.
    #[error("에이전트에 연결할 수 없습니다: {0}")]
    Unreachable(NamedHostAndPort),
    /// 원격 호출이 제한 시간을 넘긴 경우이다.
    #[error("에이전트 {agent} 응답 시간 초과 ({timeout_ms}ms)")]
    Timeout {
        agent: NamedHostAndPort,
        timeout_ms: u128,
    },
    /// 원격 호출 자체가 실패한 경우이다.
    #[error("에이전트 {agent} 실행 실패: {message}")]
    Remote {
        agent: NamedHostAndPort,
        message: String,
    },
}

/// 도달 확인 후 원격 에이전트에 Step 실행을 위임한다.
#[derive(Clone)]
pub struct DelegationGateway {
    checker: Arc<dyn ConnectionChecker>,
    client: Arc<dyn DelegationClient>,
    timeout: Duration,
}

impl std::fmt::Debug for DelegationGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationGateway")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Default for DelegationGateway {
    fn default() -> Self {
        Self::new(
            Arc::new(TcpConnectionChecker::default()),
            Arc::new(UnconfiguredDelegationClient),
            Duration::from_secs(30),
        )
    }
}

impl DelegationGateway {
    pub fn new(
        checker: Arc<dyn ConnectionChecker>,
        client: Arc<dyn DelegationClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            checker,
            client,
            timeout,
        }
    }

    pub async fn can_reach(&self, agent: &NamedHostAndPort) -> bool {
        self.checker.can_connect_to(agent).await
    }

    /// 에이전트에 Step 실행을 위임한다.
    ///
    /// # 반환값
    /// 원격 실행 결과. 도달 불가면 클라이언트를 호출하지 않고 `Unreachable`을 반환한다.
    pub async fn delegate(
        &self,
        agent: &NamedHostAndPort,
        request: RemoteExecution,
    ) -> Result<ActionOutcome, DelegationError> {
        if !self.can_reach(agent).await {
            return Err(DelegationError::Unreachable(agent.clone()));
        }
        info!(agent = %agent, step = %request.input.step_name, "delegating step");
        match tokio::time::timeout(self.timeout, self.client.execute(agent, request)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => Err(DelegationError::Remote {
                agent: agent.clone(),
                message: format!("{err:#}"),
            }),
            Err(_) => {
                warn!(agent = %agent, "delegated step timed out");
                Err(DelegationError::Timeout {
                    agent: agent.clone(),
                    timeout_ms: self.timeout.as_millis(),
                })
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{FixedChecker, RecordingClient};
    use super::*;
    use crate::scenario::Target;
    use indexmap::IndexMap;

    fn request(name: &str) -> RemoteExecution {
        RemoteExecution {
            step_type: "success".into(),
            input: ActionInput {
                step_name: name.into(),
                inputs: IndexMap::new(),
                target: Target::none(),
                context: IndexMap::new(),
            },
        }
    }

    fn agent() -> NamedHostAndPort {
        NamedHostAndPort::new("agent-a", "127.0.0.1", 1)
    }

    #[tokio::test]
    async fn unreachable_agent_never_invokes_client() {
        let client = RecordingClient::new(ActionOutcome::success());
        let gateway = DelegationGateway::new(
            Arc::new(FixedChecker(false)),
            Arc::new(client.clone()),
            Duration::from_secs(1),
        );
        let result = gateway.delegate(&agent(), request("remote")).await;
        assert!(matches!(result, Err(DelegationError::Unreachable(_))));
        assert!(client.requests().await.is_empty());
    }

    #[tokio::test]
    async fn reachable_agent_returns_remote_outcome() {
        let client = RecordingClient::new(ActionOutcome::success().with_output("id", "42"));
        let gateway = DelegationGateway::new(
            Arc::new(FixedChecker(true)),
            Arc::new(client.clone()),
            Duration::from_secs(1),
        );
        let outcome = gateway
            .delegate(&agent(), request("remote"))
            .await
            .expect("위임 성공");
        assert!(outcome.is_success());
        assert_eq!(client.requests().await, vec!["remote".to_string()]);
    }

    #[tokio::test]
    async fn slow_agent_times_out() {
        let mut client = RecordingClient::new(ActionOutcome::success());
        client.delay = Duration::from_millis(200);
        let gateway = DelegationGateway::new(
            Arc::new(FixedChecker(true)),
            Arc::new(client),
            Duration::from_millis(20),
        );
        let result = gateway.delegate(&agent(), request("slow")).await;
        assert!(matches!(result, Err(DelegationError::Timeout { .. })));
    }

    #[tokio::test]
    async fn unconfigured_client_reports_remote_error() {
        let gateway = DelegationGateway::new(
            Arc::new(FixedChecker(true)),
            Arc::new(UnconfiguredDelegationClient),
            Duration::from_secs(1),
        );
        let err = gateway
            .delegate(&agent(), request("remote"))
            .await
            .expect_err("클라이언트 미구성");
        assert!(matches!(err, DelegationError::Remote { .. }));
        assert!(err.to_string().contains("agent-a"));
    }
}
