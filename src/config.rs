use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "gradebox", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Enable debug logging
    #[arg(long, short = 'v', default_value_t = false)]
    pub verbose: bool,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Override the SANDBOX_COUNT pool capacity
    #[arg(long)]
    pub sandboxes: Option<u32>,
}

/// Runtime configuration, read from the environment at startup.
#[derive(Debug)]
pub struct Config {
    /// Root directory under which user repositories are cloned
    pub repo_folder: PathBuf,
    /// Host (and optional port) of the Git platform serving user repos
    pub git_host: String,
    /// Number of pre-provisioned isolate boxes, ids [0, N)
    pub sandbox_count: u32,
    /// Path to the bundled scoring parser binary
    pub parser_path: PathBuf,
    /// Scratch directory where question scripts are materialized
    pub script_folder: PathBuf,
    pub bind_address: String,
    pub bind_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let sandbox_count = match env::var("SANDBOX_COUNT") {
            Ok(raw) => raw
                .parse::<u32>()
                .with_context(|| format!("SANDBOX_COUNT is not a number: {raw}"))?,
            Err(_) => 4,
        };
        let bind_port = match env::var("BIND_PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("BIND_PORT is not a port number: {raw}"))?,
            Err(_) => 8080,
        };

        Ok(Self {
            repo_folder: var_or("REPO_FOLDER", "./repos").into(),
            git_host: var_or("GIT_HOST", "localhost:3000"),
            sandbox_count,
            parser_path: var_or("PARSER_PATH", "./sandbox/grp_parser/grp_parser").into(),
            script_folder: var_or("SCRIPT_FOLDER", "./sandbox/scripts").into(),
            bind_address: var_or("BIND_ADDRESS", "127.0.0.1"),
            bind_port,
        })
    }

    /// URL a user repository is cloned from.
    pub fn clone_url(&self, user_repo_path: &str) -> String {
        format!("http://{}/{}", self.git_host, user_repo_path)
    }

    /// Target directory for one clone attempt. The uuid suffix keeps
    /// concurrent judges of the same user repository apart.
    pub fn clone_target(&self, user_repo_path: &str) -> PathBuf {
        self.repo_folder
            .join(user_repo_path)
            .join(Uuid::new_v4().to_string())
    }
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            repo_folder: PathBuf::from("/tmp/repos"),
            git_host: "git.example.org:3000".to_string(),
            sandbox_count: 4,
            parser_path: PathBuf::from("./sandbox/grp_parser/grp_parser"),
            script_folder: PathBuf::from("./sandbox/scripts"),
            bind_address: "127.0.0.1".to_string(),
            bind_port: 8080,
        }
    }

    #[test]
    fn clone_url_joins_host_and_repo_path() {
        let config = test_config();
        assert_eq!(
            config.clone_url("alice/sol-q7"),
            "http://git.example.org:3000/alice/sol-q7"
        );
    }

    #[test]
    fn clone_targets_are_distinct_per_attempt() {
        let config = test_config();
        let first = config.clone_target("alice/sol-q7");
        let second = config.clone_target("alice/sol-q7");
        assert_ne!(first, second);
        assert!(first.starts_with("/tmp/repos/alice/sol-q7"));
    }
}
