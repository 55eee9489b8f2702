use crate::scheduler::ai::DEFAULT_MODEL;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub base_url: String,
    pub polling_interval: Duration,
    /// Cycles starting closer than this to the previous cycle start are skipped.
    pub min_cycle_spacing: Duration,
    pub fetch_timeout: Duration,
    pub advisor_timeout: Duration,
    pub persist_timeout: Duration,
    pub ai_credential: Option<String>,
    pub ai_model: String,
    pub auto_start: bool,
    pub schedule_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            polling_interval: Duration::from_millis(20_000),
            min_cycle_spacing: Duration::from_secs(15),
            fetch_timeout: Duration::from_secs(30),
            advisor_timeout: Duration::from_secs(30),
            persist_timeout: Duration::from_secs(10),
            ai_credential: None,
            ai_model: DEFAULT_MODEL.to_string(),
            auto_start: false,
            schedule_dir: PathBuf::from("data/schedules"),
        }
    }
}

/// Engine settings as command line flags, each backed by a `RAILFLOW_*` variable.
#[derive(clap::Args, Debug, Clone)]
pub struct EngineArgs {
    /// Base URL of the train data API
    #[arg(long, env = "RAILFLOW_BASE_URL", default_value = "http://localhost:8000")]
    pub base_url: String,
    #[arg(
        long,
        env = "RAILFLOW_POLL_INTERVAL_MS",
        default_value_t = 20_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub poll_interval_ms: u64,
    /// Bearer credential for the schedule advisor
    #[arg(long, env = "RAILFLOW_AI_KEY", hide_env_values = true)]
    pub ai_key: Option<String>,
    #[arg(long, env = "RAILFLOW_AI_MODEL", default_value = DEFAULT_MODEL)]
    pub ai_model: String,
    /// Start polling as soon as the server is up
    #[arg(
        long,
        env = "RAILFLOW_AUTO_START",
        action = clap::ArgAction::SetTrue,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub auto_start: bool,
    #[arg(long, env = "RAILFLOW_SCHEDULE_DIR", default_value = "data/schedules")]
    pub schedule_dir: PathBuf,
}

impl From<EngineArgs> for EngineConfig {
    fn from(args: EngineArgs) -> Self {
        let defaults = Self::default();

        let base_url = match args.base_url.trim().trim_end_matches('/') {
            "" => defaults.base_url,
            url => url.to_string(),
        };

        let ai_model = match args.ai_model.trim() {
            "" => defaults.ai_model,
            model => model.to_string(),
        };

        Self {
            base_url,
            polling_interval: Duration::from_millis(args.poll_interval_ms),
            // an empty key counts as no key
            ai_credential: args.ai_key.filter(|key| !key.trim().is_empty()),
            ai_model,
            auto_start: args.auto_start,
            schedule_dir: args.schedule_dir,
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        engine: EngineArgs,
    }

    fn config_from(flags: &[&str]) -> Result<EngineConfig, clap::Error> {
        let argv = std::iter::once("juniper").chain(flags.iter().copied());
        Cli::try_parse_from(argv).map(|cli| EngineConfig::from(cli.engine))
    }

    #[test]
    fn no_flags_give_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.polling_interval, Duration::from_secs(20));
        assert_eq!(config.ai_model, "llama-3.3-70b-versatile");
        assert!(!config.auto_start);
    }

    #[test]
    fn flags_override_defaults() {
        let config = config_from(&[
            "--base-url",
            "http://rail.internal:9000/",
            "--poll-interval-ms",
            "5000",
            "--ai-key",
            "secret",
            "--auto-start",
            "--schedule-dir",
            "/var/lib/railflow",
        ])
        .unwrap();

        assert_eq!(config.base_url, "http://rail.internal:9000");
        assert_eq!(config.polling_interval, Duration::from_secs(5));
        assert_eq!(config.ai_credential.as_deref(), Some("secret"));
        assert!(config.auto_start);
        assert_eq!(config.schedule_dir, PathBuf::from("/var/lib/railflow"));
        assert_eq!(config.fetch_timeout, Duration::from_secs(30));
    }

    #[test]
    fn blank_key_means_no_advisor() {
        let config = config_from(&["--ai-key", "  "]).unwrap();
        assert_eq!(config.ai_credential, None);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(config_from(&["--poll-interval-ms", "soon"]).is_err());
        assert!(config_from(&["--poll-interval-ms", "0"]).is_err());
    }

    #[test]
    fn every_setting_reads_its_variable() {
        let command = <Cli as clap::CommandFactory>::command();
        let env_of = |id: &str| {
            command
                .get_arguments()
                .find(|arg| arg.get_id() == id)
                .and_then(|arg| arg.get_env())
                .and_then(|env| env.to_str())
                .map(str::to_string)
        };

        assert_eq!(env_of("base_url").as_deref(), Some("RAILFLOW_BASE_URL"));
        assert_eq!(env_of("poll_interval_ms").as_deref(), Some("RAILFLOW_POLL_INTERVAL_MS"));
        assert_eq!(env_of("ai_key").as_deref(), Some("RAILFLOW_AI_KEY"));
        assert_eq!(env_of("ai_model").as_deref(), Some("RAILFLOW_AI_MODEL"));
        assert_eq!(env_of("auto_start").as_deref(), Some("RAILFLOW_AUTO_START"));
        assert_eq!(env_of("schedule_dir").as_deref(), Some("RAILFLOW_SCHEDULE_DIR"));
    }
}
