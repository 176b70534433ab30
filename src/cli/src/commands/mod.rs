//! CLI command definitions and dispatch.

mod copy;

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use skiff_core::CopyError;
use skiff_image::{Policy, PolicyContext, SystemContext};

/// skiff - copy container images between registries, daemons and local storage.
#[derive(Parser)]
#[command(name = "skiff", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags accepted before the subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Enable debug output
    #[arg(long)]
    pub debug: bool,

    /// Path to a trust policy file
    #[arg(long, value_name = "PATH")]
    pub policy: Option<PathBuf>,

    /// Run the tool without any policy check
    #[arg(long)]
    pub insecure_policy: bool,

    /// Use registry configuration files in DIR (e.g. for container signature storage)
    #[arg(long = "registries.d", value_name = "DIR")]
    pub registries_d: Option<PathBuf>,

    /// Use ARCH instead of the running architecture for choosing images
    #[arg(long, value_name = "ARCH")]
    pub override_arch: Option<String>,

    /// Use OS instead of the running OS for choosing images
    #[arg(long, value_name = "OS")]
    pub override_os: Option<String>,

    /// Timeout for the command execution (e.g. "30s", "5m", "1h30m")
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub command_timeout: Option<Duration>,
}

impl GlobalArgs {
    /// Load the trust policy selected by the global flags.
    pub fn policy_context(&self) -> skiff_core::Result<PolicyContext> {
        if self.insecure_policy {
            return Ok(PolicyContext::new(Policy::insecure_accept_anything()));
        }
        let ctx = SystemContext {
            signature_policy_path: self.policy.clone(),
            ..Default::default()
        };
        Ok(PolicyContext::new(Policy::default_policy(&ctx)?))
    }
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Copy an IMAGE-NAME from one location to another
    #[command(long_about = copy::long_about())]
    Copy(copy::CopyArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Copy(args) => copy::execute(args, &cli.global).await,
    }
}

/// Parse a duration such as `90`, `30s`, `5m`, `1h30m` or `500ms`.
/// A bare number is seconds.
pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration \"{s}\""))?;
        if digits == 0 {
            return Err(format!("invalid duration \"{s}\""));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration \"{s}\""))?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            other => return Err(format!("unknown unit \"{other}\" in duration \"{s}\"")),
        };
        total += unit;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Run `operation`, giving up after `timeout` or on Ctrl-C.
pub(crate) async fn run_with_timeout<T, F>(
    operation: F,
    timeout: Option<Duration>,
) -> Result<T, Box<dyn std::error::Error>>
where
    F: Future<Output = skiff_core::Result<T>>,
{
    let deadline = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = operation => Ok(result?),
        _ = deadline => Err(CopyError::TimeoutError(format!(
            "command timed out after {:?}",
            timeout.unwrap_or_default()
        ))
        .into()),
        _ = tokio::signal::ctrl_c() => Err("interrupted".into()),
    }
}
