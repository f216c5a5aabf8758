/// Initializes `env_logger` with a level driven by the `debug` config key
/// rather than the usual `RUST_LOG` convention, since this crate has exactly
/// one runtime verbosity knob (spec §6).
pub fn init(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init();
}
