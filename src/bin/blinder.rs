use ctmixnet::blinder::{Blinder, DirKeyReader};

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Ristretto255 OPRF evaluation service.
#[derive(Parser)]
struct Args {
	/// Address to listen on.
	#[arg(long = "listen_addr", default_value = "0.0.0.0:8787")]
	listen_addr: SocketAddr,
	/// Directory holding one `<day>.key` master-key file per day.
	#[arg(long = "key_dir")]
	key_dir: PathBuf,
}

#[tokio::main]
async fn main() {
	env_logger::init();
	let args = Args::parse();

	let blinder = Arc::new(Blinder::new(Arc::new(DirKeyReader::new(args.key_dir))));
	if let Err(e) = ctmixnet::blinder::listen(args.listen_addr, blinder).await {
		log::error!("blinder failed: {}", e);
		std::process::exit(1);
	}
}
