use std::env;

#[tokio::main]
async fn main() -> treefetch::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().skip(1).collect();
    let invocation = match treefetch::cli::parse_args(&args) {
        Ok(Some(invocation)) => invocation,
        Ok(None) => {
            treefetch::cli::print_usage();
            std::process::exit(0);
        }
        Err(message) => {
            eprintln!("Error: {message}");
            eprintln!();
            treefetch::cli::print_usage();
            std::process::exit(2);
        }
    };

    treefetch::cli::run(invocation).await
}
