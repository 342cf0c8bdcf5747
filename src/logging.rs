//! Logging setup.
//!
//! Library code never calls this itself — it only uses `log::{debug,info,
//! warn,error}!`. This is a convenience initializer for embedders that want
//! the common filter-by-`RUST_LOG`-with-a-default pattern without wiring up
//! `env_logger` themselves.

/// Install an `env_logger` subscriber. `default_filter` sets the level used
/// when `RUST_LOG` is unset (e.g. `"info"` or `"off"`); each log line is
/// tagged with the emitting thread so concurrent runs stay distinguishable.
pub fn init(default_filter: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format(|buf, record| {
            use std::io::Write;

            let thread_id = format!("{:?}", std::thread::current().id());
            writeln!(
                buf,
                "[{} {} {}] {}",
                buf.timestamp_millis(),
                record.level(),
                thread_id,
                record.args()
            )
        })
        .init();
}
