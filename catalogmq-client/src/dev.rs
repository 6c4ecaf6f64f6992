use std::io::Write;

/// Set up `env_logger` with colored levels, millisecond timestamps and source locations. The
/// level filter comes from `RUST_LOG`.
pub fn setup_logger() {
    let mut builder = env_logger::Builder::from_default_env();

    builder
        .format(|buf, record| {
            let lvl = buf.default_level_style(record.level()).bold();

            writeln!(
                buf,
                "{} - [{lvl}{:5}{lvl:#}] {}:{} - {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Always);

    // Tests and demos may call this more than once.
    let _ = builder.try_init();
}
