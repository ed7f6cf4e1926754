mod cli;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use imagine_gateway::config::GatewayConfig;
use imagine_gateway::generation::{OutcomeReport, StreamEvent};
use imagine_gateway::logging::init_logging;
use imagine_gateway::services::ServiceContainer;
use serde::Serialize;
use tracing::info;

use crate::cli::{Args, Commands, GenerateArgs, ImagesCommand};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = GatewayConfig::from_env_or_default().context("Invalid configuration")?;
    let (logging, _guard) = init_logging(&config.log_dir).context("Failed to initialize logging")?;

    let services = ServiceContainer::new(&config)
        .await
        .context("Failed to initialize services")?;
    logging.start_retention_cleanup(services.cancellation_token());

    let result = run(&services, args.command).await;
    services.shutdown().await;
    result
}

async fn run(services: &ServiceContainer, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Generate(args) => generate(services, args).await,
        Commands::Status => print_json(&services.pool.status().await?),
        Commands::Reload => {
            let count = services.pool.reload().await?;
            print_json(&serde_json::json!({ "status": "success", "count": count }))
        }
        Commands::ResetUsage => {
            services.pool.reset_usage().await?;
            print_json(&serde_json::json!({ "status": "success" }))
        }
        Commands::Images { command } => match command {
            ImagesCommand::List { limit } => print_json(&services.images.list(limit).await?),
            ImagesCommand::Clear => {
                let deleted = services.images.clear().await?;
                print_json(&serde_json::json!({ "status": "success", "deleted": deleted }))
            }
        },
    }
}

async fn generate(services: &ServiceContainer, args: GenerateArgs) -> anyhow::Result<()> {
    let mut request = services.request(args.prompt);
    if let Some(ratio) = args.aspect_ratio {
        request = request.with_aspect_ratio(ratio);
    } else if let Some(size) = args.size.as_deref() {
        request = request.with_size(size);
    }
    if let Some(count) = args.count {
        request = request.with_image_count(count);
    }
    if let Some(token) = args.credential {
        request = request.with_credential(token);
    }
    info!(?request, "Starting generation");

    let outcome = if args.stream {
        let mut stream = services.generator.generate_stream(request);
        let mut outcome = None;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Progress(progress) => {
                    println!("{}", serde_json::to_string(&progress)?);
                }
                StreamEvent::Result(result) => {
                    outcome = Some(result);
                    break;
                }
            }
        }
        outcome.context("Generation ended without a result")?
    } else {
        services.generator.generate(&request, None).await
    };

    print_json(&OutcomeReport::from_outcome(&outcome))?;
    if let Err(e) = &outcome {
        anyhow::bail!("Generation failed: {}", e.kind());
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
