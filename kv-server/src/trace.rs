use std::str::FromStr;

use anyhow::Result;
use log::LevelFilter;

/// Wires the `log` facade to a fern dispatcher: timestamped lines on
/// stdout, warnings and up duplicated to stderr in color.
pub fn init_logging(level: &str) -> Result<()> {
    let level = LevelFilter::from_str(level)?;

    let colors = fern::colors::ColoredLevelConfig::new()
        .warn(fern::colors::Color::Yellow)
        .error(fern::colors::Color::Red);

    let stdout = fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{}] - {} - [{}] {}",
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    let stderr = fern::Dispatch::new()
        .level(LevelFilter::Warn)
        .format(move |out, message, record| {
            out.finish(format_args!(
                "\x1B[{}m{}\x1B[0m",
                colors.get_color(&record.level()).to_fg_str(),
                message
            ))
        })
        .chain(std::io::stderr());

    if fern::Dispatch::new().chain(stdout).chain(stderr).apply().is_err() {
        eprintln!("logger has already been set");
    }
    Ok(())
}
