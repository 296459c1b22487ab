mod face;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use tracing::{info, warn};

use webpilot::{AgentRunLoop, Browser, ChromeBrowser, OpenAiModel, PilotConfig, SessionRegistry};

/// Browser automation agent exposed over a JSON/SSE session API.
#[derive(Parser, Debug)]
#[command(name = "agent", version, about)]
struct Cli {
    /// Port for the session API (falls back to the next free one of ten).
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Run Chrome without a window.
    #[arg(long, conflicts_with = "headed")]
    headless: bool,

    /// Run Chrome with a visible window.
    #[arg(long)]
    headed: bool,

    /// Default step limit per task.
    #[arg(long)]
    max_steps: Option<usize>,

    /// Debug logging for the agent.
    #[arg(short, long)]
    verbose: bool,
}

fn initialize_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("webpilot={level},agent={level},warn")));

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    initialize_logging(cli.verbose);

    let mut config = PilotConfig::from_env().context("invalid configuration")?;
    if cli.headless {
        config.browser.headless = true;
    }
    if cli.headed {
        config.browser.headless = false;
    }
    if let Some(max_steps) = cli.max_steps {
        anyhow::ensure!(max_steps > 0, "--max-steps must be at least 1");
        config.agent.max_steps = max_steps;
    }

    info!("starting browser agent");

    // Chrome startup blocks for a while; keep it off the runtime threads.
    let browser_config = config.browser.clone();
    let chrome = tokio::task::spawn_blocking(move || ChromeBrowser::launch(&browser_config))
        .await
        .context("browser launch panicked")?
        .context("could not start Chrome")?;
    let browser: Arc<dyn Browser> = Arc::new(chrome);

    let model = OpenAiModel::new(&config.model).context("model setup failed")?;
    info!(model = model.model_name(), "model ready");

    let agent = Arc::new(AgentRunLoop::new(
        browser.clone(),
        Arc::new(model),
        config.agent.clone(),
    ));
    let registry = Arc::new(SessionRegistry::new(
        browser,
        agent,
        config.registry.clone(),
    ));
    let sweeper = registry.spawn_sweeper();

    let listener = face::bind(cli.port).await?;
    face::serve(listener, registry.clone(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("could not listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        info!("shutting down");
    })
    .await?;

    sweeper.abort();
    registry.shutdown().await;
    Ok(())
}
