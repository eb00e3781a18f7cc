//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Not authenticated: the control plane rejected the operator token.")]
    NotAuthenticated,

    #[error("API error ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
        request_id: Option<String>,
    },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CliError {
    pub fn api(
        status: u16,
        code: impl Into<String>,
        message: impl Into<String>,
        request_id: Option<String>,
    ) -> Self {
        Self::Api {
            status,
            code: code.into(),
            message: message.into(),
            request_id,
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        match cli_err {
            CliError::NotAuthenticated => {
                eprintln!(
                    "\n{}",
                    "Hint: Pass --token or set FLEET_OPERATOR_TOKEN.".yellow()
                );
            }
            CliError::Api { status: 403, .. } => {
                eprintln!(
                    "\n{}",
                    "Hint: Deployer actions need the operator token, not the agent token.".yellow()
                );
            }
            CliError::Api {
                code,
                request_id,
                ..
            } => {
                if code == "duplicate_slug" {
                    eprintln!("\n{}", "Hint: Pick another slug.".yellow());
                }
                if let Some(request_id) = request_id {
                    eprintln!("\nRequest ID: {}", request_id);
                }
            }
            CliError::Network(_) => {
                eprintln!(
                    "\n{}",
                    "Hint: Check --control-url and that the control plane is running.".yellow()
                );
            }
            CliError::Other(_) => {}
        }
    }
}
