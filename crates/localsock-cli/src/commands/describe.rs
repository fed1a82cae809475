use anyhow::Result;

use localsock_core::{RunConfig, SocketDefaults};

use super::serve::EchoHandler;

/// Print the diagnostics of the run config `serve` would use for these arguments
pub fn run(title: &str, path: &str, markdown: bool, defaults: SocketDefaults) -> Result<()> {
    let config = RunConfig::with_defaults(title, path, &EchoHandler, defaults)?;

    if markdown {
        println!("{}", config.markdown_string());
    } else {
        println!("{}", config.log_string());
    }

    Ok(())
}
