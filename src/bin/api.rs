use std::sync::Arc;
use stockpulse_agent::{
    api::start_server,
    digest::{DigestJob, DigestScheduler, LogNotifier, Notifier, TwilioNotifier},
    Agent, Settings,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;

    info!("🚀 StockPulse WhatsApp Agent - API Server");
    info!("📍 Address: {}", settings.bind_address());

    let agent = Arc::new(Agent::from_settings(&settings)?);
    let shutdown = CancellationToken::new();

    info!("✅ Agent initialized");

    if settings.digest_enabled {
        let notifier: Arc<dyn Notifier> = match &settings.twilio {
            Some(twilio) => Arc::new(TwilioNotifier::new(twilio.clone())?),
            None => {
                warn!("Twilio not configured; daily digests will only be logged");
                Arc::new(LogNotifier)
            }
        };

        let job = Arc::new(DigestJob::new(
            agent.registry().clone(),
            agent.records().clone(),
            notifier,
        ));

        match DigestScheduler::new(job, settings.daily_update_hour, settings.daily_update_minute) {
            Some(scheduler) => {
                tokio::spawn(scheduler.run(shutdown.clone()));
            }
            None => warn!("Invalid digest time; scheduler not started"),
        }
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            shutdown.cancel();
        });
    }

    info!("📡 Starting API server...");
    start_server(agent, &settings.bind_address(), shutdown).await?;

    Ok(())
}
