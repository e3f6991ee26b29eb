//! # PDF Chat CLI (`pdfchat`)
//!
//! ## Usage
//!
//! ```bash
//! pdfchat --config ./config/pdfchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `pdfchat init` | Create the SQLite database and run schema migrations |
//! | `pdfchat index <path>` | Extract, chunk and index a PDF |
//! | `pdfchat pdfs` | List indexed PDFs |
//! | `pdfchat conversation new --pdf <id>` | Start a conversation about a PDF |
//! | `pdfchat ask <conversation> "<question>"` | Ask a question, streaming the answer |
//! | `pdfchat history <conversation>` | Print a conversation's messages |
//! | `pdfchat serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pdf_chat::cli::{self, LogLevel};
use pdf_chat::{config, migrate, server};

/// PDF Chat: ask questions about your PDFs.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/pdfchat.example.toml` for a full example.
#[derive(Parser, Debug)]
#[command(name = "pdfchat", version, about = "Chat with your PDFs")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/pdfchat.toml")]
    config: PathBuf,

    /// Log verbosity.
    #[arg(long, global = true, value_enum, default_value = "info")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Index a PDF so it can be discussed.
    Index {
        /// Path to the PDF file.
        path: PathBuf,

        /// Display name. Defaults to the file name.
        #[arg(long)]
        name: Option<String>,
    },

    /// List indexed PDFs.
    Pdfs,

    /// Manage conversations.
    Conversation {
        #[command(subcommand)]
        action: ConversationAction,
    },

    /// Ask a question in an existing conversation.
    Ask {
        /// Conversation id.
        conversation: String,

        /// The question.
        question: String,

        /// Wait for the whole answer instead of streaming tokens.
        #[arg(long)]
        no_stream: bool,
    },

    /// Print a conversation's messages in order.
    History {
        /// Conversation id.
        conversation: String,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[derive(Subcommand, Debug)]
enum ConversationAction {
    /// Start a new conversation about a PDF and print its id.
    New {
        /// PDF id returned by `pdfchat index`.
        #[arg(long = "pdf")]
        pdf_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli::init_tracing(cli.log_level);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index { path, name } => {
            cli::run_index(&cfg, &path, name).await?;
        }
        Commands::Pdfs => {
            cli::run_list_pdfs(&cfg).await?;
        }
        Commands::Conversation { action } => match action {
            ConversationAction::New { pdf_id } => {
                cli::run_new_conversation(&cfg, &pdf_id).await?;
            }
        },
        Commands::Ask {
            conversation,
            question,
            no_stream,
        } => {
            cli::run_ask(&cfg, &conversation, &question, !no_stream).await?;
        }
        Commands::History { conversation } => {
            cli::run_history(&cfg, &conversation).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ask_defaults_to_streaming() {
        let cli = Cli::try_parse_from(["pdfchat", "ask", "c1", "what is it?"]).unwrap();
        match cli.command {
            Commands::Ask {
                conversation,
                question,
                no_stream,
            } => {
                assert_eq!(conversation, "c1");
                assert_eq!(question, "what is it?");
                assert!(!no_stream);
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(cli.log_level, LogLevel::Info);
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "pdfchat",
            "conversation",
            "new",
            "--pdf",
            "p1",
            "--config",
            "other.toml",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("other.toml"));
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert!(matches!(
            cli.command,
            Commands::Conversation {
                action: ConversationAction::New { ref pdf_id }
            } if pdf_id == "p1"
        ));
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        assert!(Cli::try_parse_from(["pdfchat", "--log-level", "loud", "init"]).is_err());
    }
}
