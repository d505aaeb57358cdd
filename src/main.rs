use clap::Parser;
use pipewright::cli::Cli;
use pipewright::error::PipewrightError;

/// Exit code for errors outside the pipewright taxonomy (settings, I/O, logging setup)
const EXIT_OTHER: i32 = 5;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match cli.load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    if let Err(e) = cli.init_logging(&settings) {
        eprintln!("Error: failed to initialise logging: {:#}", e);
        std::process::exit(EXIT_OTHER);
    }

    let code = match cli.execute(&settings).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<PipewrightError>()
                .map(PipewrightError::exit_code)
                .unwrap_or(EXIT_OTHER)
        }
    };
    std::process::exit(code);
}
