use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

const RESERVED_PATHS: [&str; 3] = ["/", "/health", "/ready"];

#[derive(Debug, Parser)]
#[command(name = "learning-progress-service")]
#[command(about = "GraphQL service for learner progress, achievements and certificates")]
pub struct Args {
    #[arg(long, env = "LP_DATABASE_PATH", default_value = "./learning_progress.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "LP_BIND", default_value = "127.0.0.1:8000")]
    bind: SocketAddr,
    #[arg(long, env = "LP_PROJECT_NAME", default_value = "Progress Service")]
    project_name: String,
    #[arg(long, env = "LP_GRAPHQL_PATH", default_value = "/graphql")]
    graphql_path: String,
    #[arg(long, env = "LP_GRAPHQL_PLAYGROUND", default_value_t = true, action = ArgAction::Set)]
    graphql_playground: bool,
    #[arg(long, env = "LP_OPERATION_TIMEOUT_MS", default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long, env = "LP_DEBUG")]
    debug: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("graphql path MUST start with '/': {0}")]
    GraphqlPathNotAbsolute(String),
    #[error("graphql path {0} collides with a built-in route")]
    GraphqlPathReserved(String),
    #[error("project name cannot be empty")]
    EmptyProjectName,
    #[error("operation timeout must be greater than zero")]
    ZeroTimeout,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub database_path: PathBuf,
    pub bind: SocketAddr,
    pub project_name: String,
    pub graphql_path: String,
    pub graphql_playground: bool,
    pub operation_timeout: Duration,
    pub debug: bool,
}

impl TryFrom<Args> for ServiceConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let graphql_path = args.graphql_path.trim().to_string();
        if !graphql_path.starts_with('/') {
            return Err(ConfigError::GraphqlPathNotAbsolute(graphql_path));
        }
        if RESERVED_PATHS.contains(&graphql_path.as_str()) {
            return Err(ConfigError::GraphqlPathReserved(graphql_path));
        }

        let project_name = args.project_name.trim().to_string();
        if project_name.is_empty() {
            return Err(ConfigError::EmptyProjectName);
        }

        if args.operation_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(Self {
            database_path: args.db,
            bind: args.bind,
            project_name,
            graphql_path,
            graphql_playground: args.graphql_playground,
            operation_timeout: Duration::from_millis(args.operation_timeout_ms),
            debug: args.debug,
        })
    }
}

impl ServiceConfig {
    /// Defaults for an in-process service over `database_path`.
    #[cfg(test)]
    pub fn for_database(database_path: PathBuf) -> Self {
        Self {
            database_path,
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            project_name: "Progress Service".to_string(),
            graphql_path: "/graphql".to_string(),
            graphql_playground: true,
            operation_timeout: Duration::from_millis(2500),
            debug: false,
        }
    }

    /// Filter directive used when `RUST_LOG` is unset.
    pub fn default_log_directive(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }
}
