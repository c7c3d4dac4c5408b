//! Config subcommand handlers.

use std::path::Path;

use netconn_config::{Config, ConfigError};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

pub fn handle(
    args: ConfigArgs,
    global: &GlobalOpts,
    path: &Path,
    loaded: Result<Config, ConfigError>,
) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Path => {
            output::print_output(&path.display().to_string(), global.quiet);
            Ok(())
        }

        ConfigCommand::Show => {
            let cfg = loaded.map_err(|e| CliError::from_config(e, path))?;
            let text = match global.output {
                OutputFormat::Json => serde_json::to_string_pretty(&cfg)?,
                OutputFormat::JsonCompact => serde_json::to_string(&cfg)?,
                OutputFormat::Table | OutputFormat::Plain => {
                    netconn_config::render_config(&cfg).map_err(|e| CliError::from_config(e, path))?
                }
            };
            output::print_output(text.trim_end(), global.quiet);
            Ok(())
        }

        ConfigCommand::Validate => {
            let cfg = loaded.map_err(|e| CliError::from_config(e, path))?;
            cfg.validate().map_err(|e| CliError::from_config(e, path))?;
            let suppliers = cfg.suppliers.len();
            output::print_output(
                &format!("configuration OK ({suppliers} supplier profile(s))"),
                global.quiet,
            );
            Ok(())
        }

        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(CliError::ConfigExists {
                    path: path.display().to_string(),
                });
            }
            netconn_config::save_config(&Config::default(), path)
                .map_err(|e| CliError::from_config(e, path))?;
            eprintln!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}
