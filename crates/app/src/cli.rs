use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::monitor::{self, MonitorCliArgs, MonitorConfig};

#[derive(Parser, Debug)]
#[command(name = "printwatch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the camera, correct or stop the printer on defects.
    Monitor(MonitorCliArgs),
    /// Load and validate configuration, print the effective rule table.
    CheckConfig(MonitorCliArgs),
}

pub fn handle_commands(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Monitor(args) => monitor::run(MonitorConfig::try_from(args)?),
        Command::CheckConfig(args) => monitor::check_config(&MonitorConfig::try_from(args)?),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_monitor_flags() {
        let cli = Cli::try_parse_from([
            "printwatch",
            "monitor",
            "--port",
            "/dev/ttyACM0",
            "--classes",
            "warping,stringing",
            "--roi",
            "10,20,300,400",
            "--cooldown",
            "45",
        ])
        .unwrap();
        let Command::Monitor(args) = cli.command else {
            panic!("expected monitor");
        };
        assert_eq!(args.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(args.classes.unwrap(), vec!["warping", "stringing"]);
        assert_eq!(args.roi.unwrap(), vec![10, 20, 300, 400]);
        assert_eq!(args.cooldown, Some(45));
    }
}
