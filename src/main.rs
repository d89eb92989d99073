use anyhow::Result;
use clap::{Arg, Command};
use tracing::{info, warn};

use evinote::config::Config;
use evinote::llm::ModelSelector;
use evinote::pipeline::Pipeline;
use evinote::state::PipelineState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "evinote=info,warn".into()),
        )
        .init();

    let matches = Command::new("evinote")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Answer a question from videos, with evidence keyframes")
        .arg(
            Arg::new("question")
                .value_name("QUESTION")
                .help("The question to research")
                .required(true),
        )
        .arg(
            Arg::new("model")
                .short('m')
                .long("model")
                .value_name("MODEL")
                .help("Model name, overrides the configured default"),
        )
        .arg(
            Arg::new("provider")
                .short('p')
                .long("provider")
                .value_name("PROVIDER")
                .help("Provider id, overrides the configured default"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the full pipeline state as JSON")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let question = matches
        .get_one::<String>("question")
        .cloned()
        .unwrap_or_default();

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    });
    config.validate()?;

    let pipeline = Pipeline::new(config).await?;

    let mut selector = pipeline.default_selector();
    if let Some(model) = matches.get_one::<String>("model") {
        selector.model = model.clone();
    }
    if let Some(provider) = matches.get_one::<String>("provider") {
        selector.provider_id = provider.clone();
    }

    info!("Question: {}", question);
    info!("Model: {} via {}", selector.model, selector.provider_id);

    let start_time = std::time::Instant::now();
    let state = pipeline.run(PipelineState::new(question, selector)).await?;
    let duration = start_time.elapsed();

    if matches.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    if let Some(answer) = &state.fused_answer {
        println!("{}", answer);
    }

    info!("Finished in {:.1}s", duration.as_secs_f64());
    info!(
        "Videos found: {}, notes generated: {}, markers traced: {}",
        state.metadata.videos_found,
        state.metadata.notes_generated,
        state.metadata.markers_traced
    );
    if let Some(report) = &state.note_report {
        for failure in &report.failures {
            warn!("Skipped {}: {}", failure.url, failure.reason);
        }
    }

    Ok(())
}
