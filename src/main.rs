use std::process::ExitCode;

use clap::Parser;
use mailstash::cli::CliArgs;
use mailstash::{report, run};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let args = CliArgs::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report::failure(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}
