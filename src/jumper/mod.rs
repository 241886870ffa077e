pub mod api;
pub mod app;
pub mod config;
pub mod logging;
pub mod net;
pub mod output;
pub mod secret;
pub mod tunnel;

pub async fn run(cli: app::Cli) -> anyhow::Result<()> {
    app::run(cli).await
}
