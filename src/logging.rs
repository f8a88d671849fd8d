use anyhow::Error;

/// Route `log` output to stderr. `RUST_LOG` overrides the default `info`
/// filter.
pub fn init() -> Result<(), Error> {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init()?;
    Ok(())
}
