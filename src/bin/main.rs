use chrono::NaiveDate;
use tracing::info;
use tracing_subscriber::EnvFilter;
use verified_finance_pipeline::{agent::Orchestrator, config::PipelineConfig, models::AnalysisQuery};

const DEFAULT_QUERY: &str = "What was the mean daily return of the sample series?";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PipelineConfig::from_env()?;

    // Usage: orchestrator [--as-of YYYY-MM-DD] [query...]
    let mut args = std::env::args().skip(1).peekable();
    let mut as_of = None;
    if args.peek().map(String::as_str) == Some("--as-of") {
        args.next();
        let raw = args.next().ok_or("--as-of needs a date")?;
        as_of = Some(NaiveDate::parse_from_str(&raw, "%Y-%m-%d")?);
    }
    let text = args.collect::<Vec<_>>().join(" ");
    let text = if text.trim().is_empty() {
        DEFAULT_QUERY.to_string()
    } else {
        text
    };

    info!("Verified analysis pipeline starting");
    let orchestrator = Orchestrator::from_config(config)?;

    let query = AnalysisQuery::new(text, as_of);
    info!(query_id = %query.query_id, text = %query.text, "Running pipeline");

    let outcome = orchestrator.run(query).await?;

    println!("\n=== PIPELINE RESULT ===");
    println!("Stage: {}", outcome.state.stage());
    println!(
        "Stages: {}",
        outcome
            .audit
            .stages_visited
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    println!("Retries: {}", outcome.audit.retry_count);

    match &outcome.answer {
        Some(answer) => {
            println!("\nAnswer: {}", answer.summary);
            println!("Review: {:?}", answer.review_verdict);
            println!(
                "Debate: {:?} (quality {:.2}, {}/{} perspectives)",
                answer.synthesis.verdict,
                answer.synthesis.debate_quality,
                answer.synthesis.perspectives_completed,
                answer.synthesis.perspectives_requested
            );
        }
        None => {
            if let Some(failure) = &outcome.audit.failure {
                println!("\nFailed at {}: {} ({})", failure.stage, failure.kind, failure.reason);
            }
        }
    }

    println!("\nAudit record:");
    println!("{}", serde_json::to_string_pretty(&outcome.audit)?);

    Ok(())
}
