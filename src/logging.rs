use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over `default_level`; `LOG_FORMAT=json` selects JSON lines.
pub fn init_tracing(default_level: &str) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

  let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
  let result = if json {
    builder.json().try_init()
  } else {
    builder.try_init()
  };
  if let Err(e) = result {
    eprintln!("Tracing already initialised: {}", e);
  }
}
