use quilld::daemon::{DaemonConfig, DaemonRuntime};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--once" => mode = CliMode::Once,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mode = match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: quilld [--once]");
            println!("  --once   Run a single sync cycle, drain transfers, then exit");
            return Ok(());
        }
        mode => mode,
    };

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Once => daemon.run_once().await,
        _ => daemon.run().await,
    }
}
