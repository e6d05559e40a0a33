use anyhow::Result;
use clap::Parser;
use log::info;
use wormscan_mono::{run, setup_signal_handler, Args};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder().format_timestamp_secs().init();

    let args = Args::parse();
    let shutdown = setup_signal_handler();
    info!("Press Ctrl-C to stop polling, Ctrl-C again to force exit");

    run(args, shutdown).await
}
