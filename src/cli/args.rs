// file: src/cli/args.rs
// version: 2.0.0
// guid: f6g7h8i9-j0k1-2345-6789-012345fghijk

//! Command line argument definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "turingpi-provisioner")]
#[command(about = "Customize, cache and flash OS images for Turing Pi nodes")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (YAML)
    #[arg(short, long, global = true, env = "TURINGPI_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show what the platform probe detects
    Platform,

    /// Inspect and maintain the image caches
    Cache {
        /// Operate on the remote (BMC-side) cache
        #[arg(long)]
        remote: bool,

        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Customize an Ubuntu image for a node and flash it
    Deploy(DeployArgs),
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// List entries, optionally filtered by tags
    List {
        /// Tag filter, repeatable
        #[arg(long = "tag", value_name = "KEY=VALUE", value_parser = parse_tag)]
        tags: Vec<(String, String)>,

        #[arg(long)]
        json: bool,
    },

    /// Report orphans and hash mismatches
    Verify,

    /// Delete orphaned metadata and data files
    Cleanup {
        /// Walk nested key directories too
        #[arg(long)]
        recursive: bool,
    },

    /// Rebuild the tag index from the metadata files
    Rebuild,
}

#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    /// Node slot (1-4)
    #[arg(short, long)]
    pub node: u8,

    /// Base image URL or local path
    #[arg(short = 'i', long)]
    pub image: String,

    #[arg(long)]
    pub hostname: String,

    /// Static address in CIDR notation, e.g. 192.168.1.3/24
    #[arg(long)]
    pub address: String,

    #[arg(long)]
    pub gateway: String,

    /// DNS servers, comma separated
    #[arg(long, value_delimiter = ',')]
    pub dns: Vec<String>,

    #[arg(long, default_value = "22.04")]
    pub os_version: String,

    /// User whose password is set
    #[arg(long, default_value = "ubuntu")]
    pub user: String,

    /// Environment variable holding the password
    #[arg(long)]
    pub password_env: Option<String>,

    /// Device-tree overlay (.dtbo) to install, repeatable
    #[arg(long)]
    pub overlay: Vec<String>,

    /// Command to run on the node after boot, repeatable
    #[arg(long)]
    pub post_install: Vec<String>,

    /// Stop once the customized image is in the local cache
    #[arg(long)]
    pub skip_flash: bool,
}

/// Parse `key=value`
pub fn parse_tag(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_tag() {
        assert_eq!(parse_tag("os=ubuntu").unwrap(), ("os".to_string(), "ubuntu".to_string()));
        assert_eq!(parse_tag("note=a=b").unwrap(), ("note".to_string(), "a=b".to_string()));
        assert!(parse_tag("=x").is_err());
        assert!(parse_tag("os").is_err());
    }

    #[test]
    fn test_deploy_args() {
        let cli = Cli::try_parse_from([
            "turingpi-provisioner",
            "deploy",
            "--node",
            "3",
            "--image",
            "/images/rk1.img.xz",
            "--hostname",
            "host-3",
            "--address",
            "192.168.1.3/24",
            "--gateway",
            "192.168.1.1",
            "--dns",
            "8.8.8.8,1.1.1.1",
            "--skip-flash",
        ])
        .unwrap();
        match cli.command {
            Commands::Deploy(args) => {
                assert_eq!(args.node, 3);
                assert_eq!(args.dns, vec!["8.8.8.8", "1.1.1.1"]);
                assert!(args.skip_flash);
                assert_eq!(args.user, "ubuntu");
            }
            _ => panic!("expected deploy"),
        }
    }
}
