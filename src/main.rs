use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = vaani::cli::CliArgs::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    vaani::cli::run(args).await
}
