use clap::Parser;
use streamchat_lib::cli::{init_logging, Args};

#[tokio::main]
async fn main() {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = streamchat_lib::run(args).await {
        log::error!("streamchat exited with an error: {:?}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
