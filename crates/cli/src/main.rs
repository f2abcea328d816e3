use std::time::Duration;

use backoff::ExponentialBackoff;
use clap::{Parser, Subcommand};
use gateway_core::webhook::DEFAULT_TOLERANCE_SECS;
use gateway_core::Provider;
use tracing_subscriber::EnvFilter;

mod send;
mod sign;

use send::{send_with_backoff, Sender};
use sign::{parse_provider, read_payload, signature_headers, verify, VerifyInput};

#[derive(Debug, Parser)]
#[command(name = "pa-gateway")]
#[command(about = "ProcessAudit integration gateway operator tool", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the signature headers a provider would send for a payload
    Sign(SignArgs),
    /// Check a received signature against a payload
    Verify(VerifyArgs),
    /// POST a signed test webhook, retrying with exponential backoff
    Send(SendArgs),
}

#[derive(Debug, clap::Args)]
struct SignArgs {
    #[arg(long, value_parser = parse_provider)]
    provider: Provider,
    #[arg(long)]
    secret: String,
    /// Payload text, or @file
    #[arg(long)]
    payload: String,
    /// Unix timestamp for timestamped schemes; defaults to now
    #[arg(long)]
    timestamp: Option<i64>,
}

#[derive(Debug, clap::Args)]
struct VerifyArgs {
    #[arg(long, value_parser = parse_provider)]
    provider: Provider,
    #[arg(long)]
    secret: String,
    #[arg(long)]
    payload: String,
    #[arg(long)]
    signature: String,
    #[arg(long)]
    timestamp: Option<String>,
    #[arg(long, default_value_t = DEFAULT_TOLERANCE_SECS)]
    tolerance_secs: i64,
}

#[derive(Debug, clap::Args)]
struct SendArgs {
    #[arg(long)]
    url: String,
    #[arg(long, value_parser = parse_provider)]
    provider: Provider,
    #[arg(long)]
    secret: String,
    #[arg(long)]
    payload: String,
    /// Stop retrying after this many seconds
    #[arg(long, default_value_t = 60)]
    max_elapsed_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    match Args::parse().command {
        Command::Sign(args) => {
            let payload = read_payload(&args.payload)?;
            let timestamp = args.timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
            for (name, value) in signature_headers(args.provider, &args.secret, &payload, timestamp)? {
                println!("{}: {}", name, value);
            }
        }
        Command::Verify(args) => {
            let payload = read_payload(&args.payload)?;
            let input = VerifyInput {
                provider: args.provider,
                secret: &args.secret,
                payload: &payload,
                signature: &args.signature,
                timestamp: args.timestamp.as_deref(),
                tolerance_secs: args.tolerance_secs,
                now: chrono::Utc::now().timestamp(),
            };
            match verify(&input)? {
                Ok(()) => println!("valid"),
                Err(err) => anyhow::bail!("invalid: {} ({})", err, err.reason()),
            }
        }
        Command::Send(args) => {
            let payload = read_payload(&args.payload)?;
            let timestamp = chrono::Utc::now().timestamp();
            let headers = signature_headers(args.provider, &args.secret, &payload, timestamp)?;
            let sender = Sender::new(args.url, Duration::from_secs(30))?;
            let backoff = ExponentialBackoff {
                max_elapsed_time: Some(Duration::from_secs(args.max_elapsed_secs)),
                ..Default::default()
            };
            let status = send_with_backoff(&sender, &headers, &payload, backoff).await?;
            println!("delivered: HTTP {}", status);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_sign_args() {
        let args = Args::try_parse_from([
            "pa-gateway",
            "sign",
            "--provider", "slack",
            "--secret", "shh",
            "--payload", "{}",
            "--timestamp", "1707379800",
        ])
        .unwrap();

        match args.command {
            Command::Sign(sign) => {
                assert_eq!(sign.provider, Provider::Slack);
                assert_eq!(sign.secret, "shh");
                assert_eq!(sign.timestamp, Some(1_707_379_800));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_verify_default_tolerance() {
        let args = Args::try_parse_from([
            "pa-gateway",
            "verify",
            "--provider", "pagerduty",
            "--secret", "shh",
            "--payload", "{}",
            "--signature", "v1=00",
        ])
        .unwrap();

        match args.command {
            Command::Verify(verify) => {
                assert_eq!(verify.tolerance_secs, 300);
                assert!(verify.timestamp.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_send_args_defaults() {
        let args = Args::try_parse_from([
            "pa-gateway",
            "send",
            "--url", "http://localhost:3000/webhooks/pagerduty/org_1",
            "--provider", "pagerduty",
            "--secret", "shh",
            "--payload", "@event.json",
        ])
        .unwrap();

        match args.command {
            Command::Send(send) => {
                assert_eq!(send.max_elapsed_secs, 60);
                assert_eq!(send.payload, "@event.json");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_unsigned_provider_rejected() {
        let result = Args::try_parse_from([
            "pa-gateway",
            "sign",
            "--provider", "openai",
            "--secret", "shh",
            "--payload", "{}",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_secret_fails() {
        let result = Args::try_parse_from([
            "pa-gateway",
            "sign",
            "--provider", "slack",
            "--payload", "{}",
        ]);
        assert!(result.is_err());
    }
}
