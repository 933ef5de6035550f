//! Structured logging init, grounded on the teacher's `setup_tracing`:
//! compact formatter, module paths hidden (topic/module ids carry that
//! context instead), level controlled via `RUST_LOG`.

pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}
