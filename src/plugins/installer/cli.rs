use crate::plugins::registry::{CliConfig, CliPlugin};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

pub struct InstallerCliPlugin;

impl InstallerCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for InstallerCliPlugin {
    fn name(&self) -> &'static str {
        "installer"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("install_dir")
                .long("install-dir")
                .help_heading("Installer")
                .help("Directory committed splits are placed in")
                .default_value("./splits")
                .num_args(1),
        )
        .arg(
            Arg::new("require_confirmation")
                .long("require-confirmation")
                .help_heading("Installer")
                .help("Ask before committing or removing splits")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("auto_confirm")
                .long("yes")
                .short('y')
                .help_heading("Installer")
                .help("Approve confirmation prompts without asking")
                .action(ArgAction::SetTrue),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut CliConfig) -> anyhow::Result<()> {
        if let Some(dir) = matches.get_one::<String>("install_dir") {
            cfg.install_dir = PathBuf::from(dir);
        }
        cfg.require_confirmation = matches.get_flag("require_confirmation");
        cfg.auto_confirm = matches.get_flag("auto_confirm");
        Ok(())
    }
}
