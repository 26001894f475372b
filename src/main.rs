#[tokio::main]
async fn main() {
    let matches = brewctl::cli::parse_args();
    brewctl::boot::init_logging();

    if let Err(err) = brewctl::cli::actions::run(matches).await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
