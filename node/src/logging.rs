//! `tracing-subscriber` initialisation via the standard `FmtSubscriber` +
//! `EnvFilter` setup.

pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .expect("setting default subscriber failed");
}
