mod jumper;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = jumper::app::Cli::parse();
    jumper::run(cli).await
}
