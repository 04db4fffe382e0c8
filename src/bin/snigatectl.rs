//! snigatectl - operator CLI for the snigate control channel.
//!
//! Speaks the length-prefixed, HMAC-authenticated control protocol: one
//! request per connection, one reply back.

use std::net::IpAddr;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpStream;

use snigate::codec::{self, Command, Reply};
use snigate::control::{read_frame, seal, write_frame};

/// snigatectl - reconfigure a running snigate instance
#[derive(Parser, Debug)]
#[command(name = "snigatectl")]
#[command(version, about, long_about = None)]
struct Args {
    /// Control channel address
    #[arg(
        long,
        default_value = "127.0.0.1:4433",
        env = "SNIGATE_CONTROL_ADDR"
    )]
    addr: String,

    /// HMAC key authenticating requests (same as the server's control.key)
    #[arg(long, env = "SNIGATE_CONTROL_KEY")]
    key: String,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Insert or overwrite a routing entry
    Add {
        /// SNI hostname (or "default" for the catch-all entry)
        sni: String,
        /// Backend IP address
        host: IpAddr,
        /// Backend TCP port
        port: u16,
    },
    /// Delete a routing entry
    Remove {
        /// SNI hostname
        sni: String,
    },
    /// List the current routing table
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let command = match args.command {
        Cmd::Add { sni, host, port } => Command::Add { sni, host, port },
        Cmd::Remove { sni } => Command::Remove { sni },
        Cmd::List => Command::List,
    };

    let message = codec::cmd_to_bytes(&command)?;
    let payload = seal(args.key.as_bytes(), &message);

    let mut stream = TcpStream::connect(&args.addr)
        .await
        .with_context(|| format!("connecting to control channel at {}", args.addr))?;
    write_frame(&mut stream, &payload)
        .await
        .context("sending request")?;

    let Some(reply_bytes) = read_frame(&mut stream).await else {
        bail!("connection closed without a reply");
    };

    match codec::reply_of_bytes(&reply_bytes)? {
        Reply::Result { code: 0, message } => {
            println!("{}", message);
            Ok(())
        }
        Reply::Result { code, message } => {
            bail!("server error (code {}): {}", code, message);
        }
        Reply::Snis { entries } => {
            for entry in entries {
                println!("{}\t{}\t{}", entry.sni, entry.host, entry.port);
            }
            Ok(())
        }
    }
}
