use ctmixnet::notifier::PollServer;
use ctmixnet::store::InMemoryDb;

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Dead-drop notification service.
#[derive(Parser)]
struct Args {
	/// Address to listen on.
	#[arg(long = "listen_addr")]
	listen_addr: SocketAddr,
	/// File holding the notifier's master key bytes.
	#[arg(long = "master_key_file")]
	master_key_file: PathBuf,
}

async fn real_main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	let master = tokio::fs::read(&args.master_key_file).await?;
	let server = Arc::new(PollServer::new(&master, Arc::new(InMemoryDb::new())));
	server.run(args.listen_addr).await?;
	Ok(())
}

#[tokio::main]
async fn main() {
	env_logger::init();
	if let Err(e) = real_main().await {
		log::error!("notifierd failed: {}", e);
		std::process::exit(1);
	}
}
