use ctmixnet::client::make_client_config;
use ctmixnet::config::{self, MixnetServerConfig};

use clap::Parser;

/// Fetches every server's public key and emits a MixnetClientConfig.
#[derive(Parser)]
struct Args {
	/// Path or http(s) URL of the shared MixnetServerConfig.
	#[arg(long = "config_file")]
	config_file: String,
}

async fn real_main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	let conf: MixnetServerConfig = config::load_config(&args.config_file).await?;
	let client_conf = make_client_config(&conf).await?;
	println!("{}", serde_json::to_string(&client_conf)?);
	Ok(())
}

#[tokio::main]
async fn main() {
	env_logger::init();
	if let Err(e) = real_main().await {
		log::error!("mixnetconf failed: {}", e);
		std::process::exit(1);
	}
}
