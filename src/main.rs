mod app;

use std::process::ExitCode;

use app::error::ScrapeError;

#[tokio::main]
async fn main() -> ExitCode {
    match app::run().await {
        Ok(_) => ExitCode::SUCCESS,
        Err(ScrapeError::Interrupted) => {
            eprintln!("interrupted; progress saved, rerun to resume");
            ExitCode::from(130)
        }
        Err(err) => {
            eprintln!("postgrab: {err}");
            ExitCode::FAILURE
        }
    }
}
