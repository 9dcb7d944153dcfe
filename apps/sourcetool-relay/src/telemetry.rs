use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Installs the global subscriber. A second call (tests sharing a process) is ignored.
pub fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| {
        eprintln!("invalid log filter {filter:?}; using info");
        EnvFilter::new("info")
    });
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(true);
    let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
}
