use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ntlm_targetinfo::ntlm_target_information;


/// Output metadata about a server contained in an NTLM challenge message
/// yielded from a specified endpoint.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// The URL of an endpoint that supports NTLM authentication, whose
    /// server to obtain information about. Supported schemes: http, https,
    /// ldap, ldaps.
    url: String,

    /// The number of seconds to wait before timing out when trying to
    /// connect to the endpoint.
    #[arg(short = 'w', long, default_value_t = 5)]
    timeout: u64,

    /// Log the probe's progress to stderr.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("ntlm_targetinfo=debug")
    } else {
        EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match ntlm_target_information(&cli.url, Duration::from_secs(cli.timeout)).await {
        Ok(info) => {
            println!("{}", info);
            ExitCode::SUCCESS
        },
        Err(error) => {
            eprintln!("{}", error);
            ExitCode::FAILURE
        },
    }
}
