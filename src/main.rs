//! voxbridge demo binary
//!
//! Runs one interview session against the configured speech-dialog service
//! and prints the resulting transcript as JSON. Credentials come from the
//! environment; everything else from an optional TOML config file.

use anyhow::Context;
use std::time::Duration;
use tracing::info;
use voxbridge::plan::Stage;
use voxbridge::{BridgeConfig, CandidateIdentity, InterviewPlan, InterviewSession, ServiceCredentials};

fn credentials_from_env() -> anyhow::Result<ServiceCredentials> {
    Ok(ServiceCredentials {
        app_id: std::env::var("VOXBRIDGE_APP_ID").context("VOXBRIDGE_APP_ID not set")?,
        access_token: std::env::var("VOXBRIDGE_ACCESS_TOKEN")
            .context("VOXBRIDGE_ACCESS_TOKEN not set")?,
        resource_id: std::env::var("VOXBRIDGE_RESOURCE_ID")
            .context("VOXBRIDGE_RESOURCE_ID not set")?,
    })
}

fn demo_plan() -> InterviewPlan {
    InterviewPlan {
        stages: vec![
            Stage {
                prompt: "Walk me through a recent project you are proud of, {name}.".into(),
                expected_follow_ups: 1,
                time_budget: Duration::from_secs(300),
            },
            Stage {
                prompt: "What was the hardest technical decision in it?".into(),
                expected_follow_ups: 1,
                time_budget: Duration::from_secs(300),
            },
            Stage {
                prompt: "How would you scale that system tenfold?".into(),
                expected_follow_ups: 1,
                time_budget: Duration::from_secs(300),
            },
        ],
        greeting: Some("Hello {name}, welcome to the interview. Let's begin.".into()),
        closing: Some("Thank you for your time, {name}. We will be in touch.".into()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    info!("starting voxbridge");

    let config = match std::env::var("VOXBRIDGE_CONFIG") {
        Ok(path) => BridgeConfig::load(&path)
            .with_context(|| format!("failed to load config from {}", path))?,
        Err(_) => BridgeConfig::default(),
    };
    let credentials = credentials_from_env()?;

    let candidate = CandidateIdentity {
        name: std::env::var("VOXBRIDGE_CANDIDATE").unwrap_or_else(|_| "Candidate".into()),
        identifier: uuid::Uuid::new_v4().to_string(),
    };

    let mut session = InterviewSession::new(config, Some(credentials));
    session.start(demo_plan(), candidate).await?;
    info!("session running; press Ctrl-C to stop early");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("stop requested"),
        // The session tears its link down on its own once the plan is
        // exhausted; stop() below then just collects the transcript.
        _ = async {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if session.link_released() {
                    break;
                }
            }
        } => info!("interview completed"),
    }

    let transcript = session.stop().await?;
    println!("{}", transcript.to_json()?);
    Ok(())
}
