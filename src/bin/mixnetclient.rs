use ctmixnet::client::MixnetClient;
use ctmixnet::config::{self, MixnetClientConfig};

use clap::Parser;
use tokio::io::AsyncReadExt;

/// Reads fixed-size payloads from stdin and sends each through the cascade.
#[derive(Parser)]
struct Args {
	/// Path or http(s) URL of the MixnetClientConfig JSON.
	#[arg(long = "config")]
	config: String,
}

async fn real_main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	let conf: MixnetClientConfig = config::load_config(&args.config).await?;
	let payload_len = conf.payload_len;
	let client = MixnetClient::new(conf)?;

	let mut stdin = tokio::io::stdin();
	let mut buf = vec![0u8; payload_len];
	loop {
		if let Err(e) = stdin.read_exact(&mut buf).await {
			if e.kind() == std::io::ErrorKind::UnexpectedEof {
				return Ok(());
			}
			return Err(e.into());
		}
		if let Err(e) = client.send_message(&buf).await {
			log::error!("{}", e);
		}
	}
}

#[tokio::main]
async fn main() {
	env_logger::init();
	if let Err(e) = real_main().await {
		log::error!("mixnetclient failed: {}", e);
		std::process::exit(1);
	}
}
