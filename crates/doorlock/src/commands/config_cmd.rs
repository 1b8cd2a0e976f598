//! Config subcommand handlers.

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::BridgeError;

use doorlock_config::Config;

pub fn handle(args: &ConfigArgs, global: &GlobalOpts, config: &Config) -> Result<(), BridgeError> {
    let path = global
        .config
        .clone()
        .unwrap_or_else(doorlock_config::config_path);
    match args.command {
        ConfigCommand::Show => {
            let rendered =
                doorlock_config::to_display_toml(config).map_err(|e| BridgeError::config(e, &path))?;
            println!("{rendered}");
        }
        ConfigCommand::Path => println!("{}", path.display()),
    }
    Ok(())
}
