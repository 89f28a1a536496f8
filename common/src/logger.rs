use std::str::FromStr;

use redox_log::{OutputBuilder, RedoxLogger};

/// Environment variable that overrides the stderr log level of a driver.
pub const LOG_LEVEL_VAR: &str = "DRIVER_LOG";

fn level_from_env(default: log::LevelFilter) -> log::LevelFilter {
    std::env::var(LOG_LEVEL_VAR)
        .ok()
        .and_then(|level| log::LevelFilter::from_str(level.trim()).ok())
        .unwrap_or(default)
}

pub fn output_level() -> log::LevelFilter {
    level_from_env(log::LevelFilter::Info)
}

pub fn file_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

/// Log files written through the logging scheme: plain text and a copy
/// that keeps the ANSI colors.
fn logfile_names(logfile_base: &str) -> (String, String) {
    (format!("{logfile_base}.log"), format!("{logfile_base}.ansi.log"))
}

/// Configures logging for a single driver.
///
/// Fails if a global logger has already been installed.
#[cfg_attr(not(target_os = "redox"), allow(unused_variables, unused_mut))]
pub fn setup_logging(
    category: &str,
    subcategory: &str,
    logfile_base: &str,
    output_level: log::LevelFilter,
    file_level: log::LevelFilter,
) -> Result<(), log::SetLoggerError> {
    let mut logger = RedoxLogger::new().with_output(
        OutputBuilder::stderr()
            .with_filter(output_level)
            .with_ansi_escape_codes()
            .flush_on_newline(true)
            .build(),
    );

    let (plain_log, ansi_log) = logfile_names(logfile_base);

    #[cfg(target_os = "redox")]
    match OutputBuilder::in_redox_logging_scheme(category, subcategory, plain_log.as_str()) {
        Ok(b) => {
            logger = logger.with_output(b.with_filter(file_level).flush_on_newline(true).build())
        }
        Err(error) => eprintln!("Failed to create {plain_log}: {}", error),
    }

    #[cfg(target_os = "redox")]
    match OutputBuilder::in_redox_logging_scheme(category, subcategory, ansi_log.as_str()) {
        Ok(b) => {
            logger = logger.with_output(
                b.with_filter(file_level)
                    .with_ansi_escape_codes()
                    .flush_on_newline(true)
                    .build(),
            )
        }
        Err(error) => eprintln!("Failed to create {ansi_log}: {}", error),
    }

    logger.enable()?;
    log::debug!("{category}/{subcategory}: logging to {plain_log} and {ansi_log}");
    Ok(())
}
