use log::LevelFilter;
use log4rs::{
    append::{console::ConsoleAppender, file::FileAppender},
    config::{Appender, Config, Logger, Root},
    encode::pattern::PatternEncoder,
    init_config,
};

/// The pattern to use when logging
const LOGGING_PATTERN: &str = "[{d} {h({l})} {M}] {m}{n}";

/// The modules to enable logging for
const LOGGING_MODULES: [&str; 1] = ["relay_mesh"];

/// Setup function for setting up the Log4rs logging configuring it
/// for all the different modules and setting up file and stdout logging
pub fn setup(logging_level: LevelFilter) {
    if logging_level == LevelFilter::Off {
        return;
    }

    let pattern = Box::new(PatternEncoder::new(LOGGING_PATTERN));

    let console_appender = ConsoleAppender::builder().encoder(pattern.clone()).build();
    let file_appender = FileAppender::builder()
        .encoder(pattern)
        .build("data/server.log")
        .expect("Unable to create logging file appender");

    const APPENDERS: [&str; 2] = ["stdout", "file"];

    let mut builder = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(console_appender)))
        .appender(Appender::builder().build("file", Box::new(file_appender)));

    for module in LOGGING_MODULES {
        builder = builder.logger(
            Logger::builder()
                .appenders(APPENDERS)
                .additive(false)
                .build(module, logging_level),
        )
    }

    let config = builder
        .build(
            Root::builder()
                .appenders(APPENDERS)
                .build(LevelFilter::Warn),
        )
        .expect("Failed to create logging config");

    init_config(config).expect("Unable to initialize logger");

    // Include panics in logging
    log_panics::init();
}
