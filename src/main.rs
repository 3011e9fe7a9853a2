use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;
use wsftp::client::SftpClient;
use wsftp::server::SessionConfig;
use wsftp::transport::{connect, serve, ConnectOptions};
use wsftp::util::search::search;

mod cli;

use cli::{Cli, Commands, FindArgs, ServeArgs};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let result = match cli.cmd {
        Commands::Serve(args) => cmd_serve(args).await,
        Commands::Find(args) => cmd_find(args).await,
    };

    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }

    result
}

async fn cmd_serve(args: ServeArgs) -> Result<()> {
    let mut config = SessionConfig::default();
    if let Some(root) = args.root {
        config.virtual_root = root;
    }
    config.read_only = args.read_only;
    config.hide_uid_gid = args.hide_uid_gid;
    serve(args.listen, config).await
}

async fn cmd_find(args: FindArgs) -> Result<()> {
    let options = ConnectOptions {
        url: args.url,
        username: args.username,
        password: args.password,
    };
    let channel = connect(&options)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let client = SftpClient::bind(channel)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let matches = search(&client, &args.base, &args.pattern)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    for found in matches {
        println!("{}", found.path);
    }
    client.end();
    Ok(())
}
