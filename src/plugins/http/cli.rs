use crate::plugins::registry::{CliConfig, CliPlugin};
use clap::{Arg, ArgAction, ArgMatches, Command};

pub struct HttpCliPlugin;

impl HttpCliPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl CliPlugin for HttpCliPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn augment_command(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("http_header")
                .long("header")
                .help_heading("HTTP")
                .help("Extra HTTP header (repeatable), e.g. --header 'Authorization: Bearer xxx'")
                .action(ArgAction::Append)
                .num_args(1),
        )
        .arg(
            Arg::new("http_user_agent")
                .long("user-agent")
                .help_heading("HTTP")
                .help("HTTP User-Agent")
                .default_value("split-delivery/0.1")
                .num_args(1),
        )
        .arg(
            Arg::new("http_read_timeout_ms")
                .long("read-timeout-ms")
                .help_heading("HTTP")
                .help("Fail when the server sends nothing for this long")
                .default_value("60000")
                .num_args(1),
        )
        .arg(
            Arg::new("http_connect_timeout_secs")
                .long("connect-timeout-secs")
                .help_heading("HTTP")
                .help("Connect timeout in seconds")
                .default_value("30")
                .num_args(1),
        )
        .arg(
            Arg::new("http_progress_interval_ms")
                .long("progress-interval-ms")
                .help_heading("HTTP")
                .help("Minimum gap between progress reports")
                .default_value("1000")
                .num_args(1),
        )
    }

    fn apply_matches(&self, matches: &ArgMatches, cfg: &mut CliConfig) -> anyhow::Result<()> {
        if let Some(ua) = matches.get_one::<String>("http_user_agent") {
            cfg.driver_ctx.user_agent = ua.clone();
        }
        if let Some(s) = matches.get_one::<String>("http_read_timeout_ms") {
            cfg.driver_ctx.read_timeout_ms = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_connect_timeout_secs") {
            cfg.driver_ctx.connect_timeout_secs = s.parse()?;
        }
        if let Some(s) = matches.get_one::<String>("http_progress_interval_ms") {
            cfg.driver_ctx.progress_interval_ms = s.parse()?;
        }

        if let Some(values) = matches.get_many::<String>("http_header") {
            for h in values {
                let (k, v) = h
                    .split_once(':')
                    .ok_or_else(|| anyhow::anyhow!("invalid header format: {}", h))?;
                cfg.driver_ctx.headers.push((k.trim().to_string(), v.trim().to_string()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::registry::DriverContext;
    use std::path::PathBuf;

    fn cfg() -> CliConfig {
        CliConfig {
            driver_ctx: DriverContext::default(),
            install_dir: PathBuf::from("."),
            require_confirmation: false,
            auto_confirm: false,
        }
    }

    #[test]
    fn parses_http_flags() {
        let plugin = HttpCliPlugin::new();
        let cmd = plugin.augment_command(Command::new("t"));
        let m = cmd
            .try_get_matches_from([
                "t",
                "--header",
                "X-Token: abc",
                "--read-timeout-ms",
                "1200",
                "--progress-interval-ms",
                "50",
            ])
            .unwrap();
        let mut c = cfg();
        plugin.apply_matches(&m, &mut c).unwrap();
        assert_eq!(c.driver_ctx.read_timeout_ms, 1200);
        assert_eq!(c.driver_ctx.connect_timeout_secs, 30);
        assert_eq!(c.driver_ctx.progress_interval_ms, 50);
        assert_eq!(c.driver_ctx.headers, vec![("X-Token".to_string(), "abc".to_string())]);
    }

    #[test]
    fn rejects_malformed_header() {
        let plugin = HttpCliPlugin::new();
        let m = plugin
            .augment_command(Command::new("t"))
            .try_get_matches_from(["t", "--header", "no-colon"])
            .unwrap();
        assert!(plugin.apply_matches(&m, &mut cfg()).is_err());
    }
}
