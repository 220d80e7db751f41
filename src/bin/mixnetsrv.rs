use ctmixnet::config::{self, MixnetServerConfig};
use ctmixnet::server::MixnetServer;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// A single hop of the mixnet cascade.
#[derive(Parser)]
struct Args {
	/// Address to listen on.
	#[arg(long = "listen_addr")]
	listen_addr: SocketAddr,
	/// File holding this server's master key bytes.
	#[arg(long = "master_key_file")]
	master_key_file: PathBuf,
	/// This server's position in the cascade, counted from the exit (0).
	#[arg(long = "idx")]
	idx: usize,
	/// Path or http(s) URL of the shared MixnetServerConfig.
	#[arg(long = "config_file")]
	config_file: String,
}

async fn real_main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	let conf: MixnetServerConfig = config::load_config(&args.config_file).await?;
	let master = tokio::fs::read(&args.master_key_file).await?;

	let server = MixnetServer::new(conf, args.idx, &master)?;
	server.run(args.listen_addr).await?;
	Ok(())
}

#[tokio::main]
async fn main() {
	env_logger::init();
	if let Err(e) = real_main().await {
		log::error!("mixnetsrv failed: {}", e);
		std::process::exit(1);
	}
}
