use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{error, info};

use taskplane::circuit_breaker::CircuitBreakerRegistry;
use taskplane::config::Config;
use taskplane::database::{setup_database, PgTaskStore};
use taskplane::dispatcher::Dispatcher;
use taskplane::events::{EventRecorder, TracingRecorder};
use taskplane::feature_flags::InMemoryFeatureFlags;
use taskplane::logging::init_tracing;
use taskplane::messaging::{consume_callbacks, create_rabbit_channel, declare_queues, RabbitTransport};
use taskplane::rate_limiter::RateLimiter;
use taskplane::routes::{routes, AppState};

#[tokio::main]
async fn main() -> Result<()> {
  let config = Config::from_env()?;
  init_tracing(&config.log_level);
  info!("Starting control plane in {} mode", config.environment);

  let db_pool = setup_database(&config.database_url).await?;
  let rabbit_channel = create_rabbit_channel(&config.rabbitmq_url).await?;
  declare_queues(&rabbit_channel).await?;

  let events: Arc<dyn EventRecorder> = Arc::new(TracingRecorder);
  let breakers = Arc::new(CircuitBreakerRegistry::with_recorder(config.circuit_breaker(), events.clone()));
  let rate_limiter = Arc::new(RateLimiter::with_recorder(config.rate_limiter(), events.clone()));
  let dispatcher = Dispatcher::new(
    config.dispatcher(),
    Arc::new(PgTaskStore::new(db_pool)),
    Arc::new(RabbitTransport::new(rabbit_channel.clone())),
    breakers,
    events,
  );

  {
    let dispatcher = dispatcher.clone();
    let channel = rabbit_channel.clone();
    tokio::spawn(async move {
      if let Err(e) = consume_callbacks(channel, dispatcher).await {
        error!("Callback consumer stopped: {:?}", e);
      }
    });
  }
  {
    let rate_limiter = rate_limiter.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(Duration::from_secs(60));
      loop {
        interval.tick().await;
        rate_limiter.purge_expired(Instant::now());
      }
    });
  }

  let state = AppState {
    dispatcher,
    rate_limiter,
    flags: Arc::new(InMemoryFeatureFlags::new()),
  };

  info!("Admission API listening on port {}", config.server_port);
  warp::serve(routes(state))
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}
