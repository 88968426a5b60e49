use anyhow::Result;
use gatelink_client::admission::AdmissionClient;
use gatelink_client::config::ClientConfig;
use gatelink_client::session::Client;
use gatelink_client::{cli, config};
use gatelink_core::UserKey;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = <cli::Cli as clap::Parser>::parse();
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::default_config_path()?,
    };

    match cli.command.unwrap_or(cli::Command::Run) {
        cli::Command::ConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        cli::Command::InitConfig { force } => {
            config::save(&config_path, &ClientConfig::default(), force)?;
            println!(
                "Starter config written to {}; fill in user_key before running.",
                config_path.display()
            );
            Ok(())
        }
        cli::Command::ValidateKey { key } => {
            let cfg = config::load(&config_path)?;
            let user_key: UserKey = match key {
                Some(raw) => raw.parse()?,
                None => cfg.user_key,
            };
            if user_key.is_zero() {
                anyhow::bail!("nothing to validate: no key given and none configured");
            }

            let user = AdmissionClient::new(&cfg.server_url, user_key)?
                .get_user()
                .await?;
            println!("Key belongs to {} (reserved port {})", user.email, user.port);
            Ok(())
        }
        cli::Command::Run => {
            let cfg = config::load(&config_path)?;
            if !cfg.has_key() {
                anyhow::bail!(
                    "{} has no user_key; get one from your relay operator",
                    config_path.display()
                );
            }

            let client = Arc::new(Client::new(cfg));

            let stop = client.stop_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("ctrl-c received, shutting down");
                    stop.cancel();
                }
            });

            let ready_probe = Arc::clone(&client);
            tokio::spawn(async move {
                if let Some(addr) = ready_probe.proxy_addr(Duration::from_secs(5)).await {
                    tracing::info!("game server published at {addr}");
                }
            });

            client.run().await?;
            Ok(())
        }
    }
}
