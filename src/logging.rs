use std::path::Path;

use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        file::FileAppender,
    },
    config::{Appender, Root},
    encode::pattern::PatternEncoder,
    Config,
};

const CONSOLE_PATTERN: &str = "{h({d(%Y-%m-%d %H:%M:%S)} [{l}] {M})} - {m}{n}";
const FILE_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} [{l}] [{T}] {M}:{L} - {m}{n}";

/// Set up logging to stderr and, if `log_file` is given, to that file as well.
///
/// The file gets the same level filter as the console. Worker threads log
/// through the same appenders, and the file pattern includes the thread name so
/// that messages from concurrent granule jobs can be told apart. Returns an
/// error if the file cannot be created or a logger was already installed.
pub fn init_logging(level: log::LevelFilter, log_file: Option<&Path>) -> Result<(), LoggingError> {
    let stderr = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(CONSOLE_PATTERN)))
        .target(Target::Stderr)
        .build();

    let mut builder = Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = log_file {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
            .append(false)
            .build(path)
            .map_err(|e| LoggingError::LogFile(e.to_string()))?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }

    let config = builder
        .build(root.build(level))
        .map_err(|e| LoggingError::Config(e.to_string()))?;

    log4rs::init_config(config).map_err(|e| LoggingError::Config(e.to_string()))?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Could not create the log file: {0}")]
    LogFile(String),
    #[error("Could not configure the logger: {0}")]
    Config(String),
}
