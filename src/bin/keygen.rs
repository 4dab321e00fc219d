//! Host identity generator.
//!
//! Generates the long-lived X25519 key pair a host needs for key-exchange
//! mode and prints it as a config snippet, together with the display
//! fingerprint used for pairing confirmation on the companion device.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pairlink::KeyPair;

#[derive(Parser)]
#[command(name = "pairlink-keygen", version, about = "Generate a PairLink host identity")]
struct Args {
    /// Print only the base64 secret key, for scripting
    #[arg(long)]
    secret_only: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let pair = KeyPair::generate();

    if args.secret_only {
        println!("{}", pair.secret_key_base64());
        return Ok(());
    }

    println!("# Host identity - add to pairlink.toml");
    println!("[identity]");
    println!("public_key = \"{}\"", pair.public_key_base64());
    println!("secret_key = \"{}\"", pair.secret_key_base64());
    println!();
    println!("# Fingerprint (compare on the companion device when pairing)");
    println!("# {}", pair.fingerprint());

    Ok(())
}
