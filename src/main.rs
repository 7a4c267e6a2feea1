use clap::Parser;
use futures::StreamExt;
use scenario_engine::config::{EngineConfig, FailurePolicy};
use scenario_engine::engine::{EmbeddedEngine, StepExecutionReport, StepStatus};
use scenario_engine::scenario::{
    Environment, ExecutionRequest, load_environment_from_file, load_scenario_from_file,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser)]
#[command(name = "scenario-engine")]
#[command(about = "시나리오 파일을 실행하고 Step 결과를 출력한다")]
struct Cli {
    /// 실행할 시나리오 파일.
    #[arg(required = true)]
    scenarios: Vec<PathBuf>,

    /// 변수와 대상을 담은 환경 파일.
    #[arg(long)]
    env: Option<PathBuf>,

    /// 엔진 설정 파일(YAML/JSON).
    #[arg(long)]
    config: Option<PathBuf>,

    /// 첫 실패에서 나머지 Step을 실행하지 않는다.
    #[arg(long)]
    stop_on_failure: bool,

    /// 마지막 보고서를 JSON으로 출력한다.
    #[arg(long)]
    json: bool,
}

/// 시나리오를 차례로 실행하고 하나라도 실패하면 0이 아닌 코드로 끝난다.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if cli.stop_on_failure {
        config.failure_policy = FailurePolicy::Stop;
    }
    let environment = match &cli.env {
        Some(path) => load_environment_from_file(path)?,
        None => Environment::default(),
    };
    let engine = EmbeddedEngine::new(config);

    let mut all_succeeded = true;
    for path in &cli.scenarios {
        let content = load_scenario_from_file(path)?;
        let request = ExecutionRequest::from_content(&content, &environment);
        let (_, mut stream) = engine.execute_observed(request);

        let mut printed: HashSet<Vec<usize>> = HashSet::new();
        let mut last = None;
        while let Some(item) = stream.next().await {
            let snapshot = item?;
            print_finished(&snapshot.report, &mut Vec::new(), &mut printed);
            last = Some(snapshot);
        }
        let status = last
            .as_ref()
            .map(|report| report.status())
            .unwrap_or(StepStatus::NotExecuted);
        if cli.json {
            if let Some(report) = &last {
                println!("{}", serde_json::to_string_pretty(report)?);
            }
        }
        if status != StepStatus::Success {
            all_succeeded = false;
        }
    }
    Ok(all_succeeded)
}

/// 새로 종료된 Step만 `이름 - 상태` 형식으로 출력한다. 자식이 부모보다 먼저 끝난다.
fn print_finished(
    report: &StepExecutionReport,
    path: &mut Vec<usize>,
    printed: &mut HashSet<Vec<usize>>,
) {
    for (i, child) in report.steps.iter().enumerate() {
        path.push(i);
        print_finished(child, path, printed);
        path.pop();
    }
    if report.status.is_terminal() && printed.insert(path.clone()) {
        println!("{} - {}", report.name, report.status);
    }
}
