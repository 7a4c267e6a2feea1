/// 실행 엔진 수준에서 발생하는 오류를 표현한다.
///
/// Step 하나의 실패는 오류가 아니라 보고서의 FAILURE 상태로 나타난다.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// 실행 작업 자체가 비정상 종료된 경우이다.
    #[error("실행 {execution_id}이(가) 비정상 종료되었습니다: {message}")]
    Aborted { execution_id: u64, message: String },
    /// 보고 스트림이 스냅샷 없이 끝난 경우이다.
    #[error("실행 {0}의 보고 스트림이 결과 없이 종료되었습니다.")]
    NoReport(u64),
    /// 그 밖의 내부 오류이다.
    #[error("엔진 내부 오류: {0}")]
    Internal(String),
}
