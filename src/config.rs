use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/procwatch/procwatch.toml";
pub const DEFAULT_PID_FILE: &str = "/var/run/procwatch.pid";
pub const DEFAULT_SENDMAIL: &str = "/usr/sbin/sendmail";

const MAIN_SECTION: &str = "main";
const DEFAULT_TIME_LAPSE_S: u64 = 60;
const DEFAULT_PROBE_TIMEOUT_S: u64 = 5;
const DEFAULT_COOLDOWN_S: u64 = 30;
const DEFAULT_MAX_RESTARTS: u32 = 5;
const DEFAULT_RESTART_WINDOW_S: u64 = 600;

/// Daemon‑wide settings, resolved once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSettings {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub daemonize: bool,
    pub alert_recipients: Vec<String>,
    pub config_path: PathBuf,
    pub pid_file: PathBuf,
    /// Where stdout/stderr go once detached. `None` means `/dev/null`.
    pub log_file: Option<PathBuf>,
    pub mail_from: Option<String>,
    pub sendmail: PathBuf,
}

/// One supervised application.
#[derive(Debug, Clone, PartialEq)]
pub struct AppSpec {
    pub name: String,
    /// Command name looked up in the process table.
    pub process_name: String,
    pub command: String,
    pub arguments: Vec<String>,
    pub restart_cooldown: Duration,
    pub max_restarts_per_window: u32,
    pub restart_window: Duration,
}

impl AppSpec {
    /// Spec with default restart policy, mostly useful for tests and tooling.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            process_name: name.clone(),
            name,
            command: command.into(),
            arguments: Vec::new(),
            restart_cooldown: Duration::from_secs(DEFAULT_COOLDOWN_S),
            max_restarts_per_window: DEFAULT_MAX_RESTARTS,
            restart_window: Duration::from_secs(DEFAULT_RESTART_WINDOW_S),
        }
    }
}

/// Command‑line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub daemonize: bool,
    pub time_lapse: Option<u64>,
    pub mail_addresses: Option<String>,
}

/// A list written either as a TOML array or as one delimited string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringList {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct MainSection {
    mail_addresses: Option<StringList>,
    daemonize: Option<bool>,
    time_lapse: Option<u64>,
    probe_timeout: Option<u64>,
    pid_file: Option<PathBuf>,
    log_file: Option<PathBuf>,
    mail_from: Option<String>,
    sendmail: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct AppSection {
    command: Option<String>,
    arguments: Option<StringList>,
    cooldown: Option<u64>,
    max_restarts: Option<u32>,
    restart_window: Option<u64>,
    process_name: Option<String>,
}

/// Read `path` and merge it with `cli`. Precedence is CLI, then file, then
/// built‑in default.
pub fn load(
    cli: &CliOverrides,
    path: &Path,
) -> Result<(GlobalSettings, Vec<AppSpec>), ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    parse(cli, path, &raw)
}

/// Same as [`load`] but from an in‑memory document.
pub fn parse(
    cli: &CliOverrides,
    path: &Path,
    raw: &str,
) -> Result<(GlobalSettings, Vec<AppSpec>), ConfigError> {
    let doc: toml::Table = toml::from_str(raw).map_err(|source| ConfigError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;

    let main: MainSection = doc
        .get(MAIN_SECTION)
        .cloned()
        .ok_or(ConfigError::MissingMain)?
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::InvalidSection {
            section: MAIN_SECTION.to_string(),
            message: e.message().to_string(),
        })?;

    let settings = resolve_settings(cli, path, main)?;

    let mut apps = Vec::with_capacity(doc.len());
    for (name, value) in doc {
        if name == MAIN_SECTION {
            continue;
        }
        let toml::Value::Table(_) = value else {
            return Err(ConfigError::InvalidSection {
                section: name,
                message: "expected a table of options".into(),
            });
        };
        let section: AppSection =
            value
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::InvalidSection {
                    section: name.clone(),
                    message: e.message().to_string(),
                })?;
        apps.push(resolve_app(name, section)?);
    }

    validate_apps(&apps)?;
    Ok((settings, apps))
}

fn resolve_settings(
    cli: &CliOverrides,
    path: &Path,
    main: MainSection,
) -> Result<GlobalSettings, ConfigError> {
    let time_lapse = cli
        .time_lapse
        .or(main.time_lapse)
        .unwrap_or(DEFAULT_TIME_LAPSE_S);
    if time_lapse == 0 {
        return Err(ConfigError::InvalidOption {
            option: "time-lapse",
            message: "must be at least one second".into(),
        });
    }
    let poll_interval = Duration::from_secs(time_lapse);

    let probe_timeout = main.probe_timeout.unwrap_or(DEFAULT_PROBE_TIMEOUT_S);
    if probe_timeout == 0 {
        return Err(ConfigError::InvalidOption {
            option: "probe-timeout",
            message: "must be at least one second".into(),
        });
    }
    // A probe must never hold a tick past the next one.
    let probe_timeout = Duration::from_secs(probe_timeout).min(poll_interval);

    let alert_recipients = match &cli.mail_addresses {
        Some(csv) => split_addresses(csv),
        None => match main.mail_addresses {
            Some(StringList::One(csv)) => split_addresses(&csv),
            Some(StringList::Many(list)) => list
                .iter()
                .flat_map(|entry| split_addresses(entry))
                .collect(),
            None => Vec::new(),
        },
    };
    let alert_recipients = dedup_preserving_order(alert_recipients);
    if let Some(bad) = alert_recipients.iter().find(|a| !a.contains('@')) {
        return Err(ConfigError::InvalidOption {
            option: "mail-addresses",
            message: format!("'{bad}' is not a mail address"),
        });
    }

    Ok(GlobalSettings {
        poll_interval,
        probe_timeout,
        daemonize: cli.daemonize || main.daemonize.unwrap_or(false),
        alert_recipients,
        config_path: path.to_path_buf(),
        pid_file: main.pid_file.unwrap_or_else(|| PathBuf::from(DEFAULT_PID_FILE)),
        log_file: main.log_file,
        mail_from: main.mail_from.filter(|s| !s.trim().is_empty()),
        sendmail: main.sendmail.unwrap_or_else(|| PathBuf::from(DEFAULT_SENDMAIL)),
    })
}

fn resolve_app(name: String, section: AppSection) -> Result<AppSpec, ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::InvalidSection {
            section: name,
            message: "application name must not be empty".into(),
        });
    }

    let command = match section.command {
        Some(c) if !c.trim().is_empty() => c.trim().to_string(),
        _ => return Err(ConfigError::MissingCommand(name)),
    };

    let arguments = match section.arguments {
        None => Vec::new(),
        Some(StringList::Many(list)) => list,
        Some(StringList::One(line)) => {
            shell_words::split(&line).map_err(|e| ConfigError::InvalidSection {
                section: name.clone(),
                message: format!("arguments: {e}"),
            })?
        }
    };

    let restart_window = section.restart_window.unwrap_or(DEFAULT_RESTART_WINDOW_S);
    if restart_window == 0 {
        return Err(ConfigError::InvalidSection {
            section: name,
            message: "restart-window must be at least one second".into(),
        });
    }

    let process_name = section
        .process_name
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| name.clone());

    Ok(AppSpec {
        process_name,
        command,
        arguments,
        restart_cooldown: Duration::from_secs(section.cooldown.unwrap_or(DEFAULT_COOLDOWN_S)),
        max_restarts_per_window: section.max_restarts.unwrap_or(DEFAULT_MAX_RESTARTS),
        restart_window: Duration::from_secs(restart_window),
        name,
    })
}

/// Reject empty names, empty commands and duplicates. Also used when the
/// supervisor is built from specs that never went through a file.
pub fn validate_apps(apps: &[AppSpec]) -> Result<(), ConfigError> {
    if apps.is_empty() {
        return Err(ConfigError::NoApps);
    }
    let mut seen = HashSet::with_capacity(apps.len());
    for app in apps {
        if app.name.trim().is_empty() {
            return Err(ConfigError::InvalidSection {
                section: app.name.clone(),
                message: "application name must not be empty".into(),
            });
        }
        if app.command.trim().is_empty() {
            return Err(ConfigError::MissingCommand(app.name.clone()));
        }
        if !seen.insert(app.name.as_str()) {
            return Err(ConfigError::DuplicateApp(app.name.clone()));
        }
    }
    Ok(())
}

fn split_addresses(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(|s| s.replace(' ', ""))
        .filter(|s| !s.is_empty())
        .collect()
}

fn dedup_preserving_order(list: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    list.into_iter().filter(|a| seen.insert(a.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[main]
mail-addresses = "ops@example.com, oncall@example.com"
daemonize = true
time-lapse = 20

[streamer]
command = "/usr/local/bin/streamer"
arguments = "--port 9000 --name 'edge one'"

[encoder]
command = "/usr/local/bin/encoder"
cooldown = 5
max-restarts = 2
restart-window = 120
process-name = "enc"
"#;

    fn parse_sample(cli: &CliOverrides) -> (GlobalSettings, Vec<AppSpec>) {
        parse(cli, Path::new("/tmp/procwatch.toml"), SAMPLE).unwrap()
    }

    #[test]
    fn test_file_values_apply_without_cli() {
        let (settings, apps) = parse_sample(&CliOverrides::default());
        assert_eq!(settings.poll_interval, Duration::from_secs(20));
        assert!(settings.daemonize);
        assert_eq!(
            settings.alert_recipients,
            vec!["ops@example.com".to_string(), "oncall@example.com".to_string()]
        );
        assert_eq!(settings.pid_file, PathBuf::from(DEFAULT_PID_FILE));
        assert_eq!(settings.probe_timeout, Duration::from_secs(DEFAULT_PROBE_TIMEOUT_S));
        assert_eq!(apps.len(), 2);
    }

    #[test]
    fn test_apps_keep_file_order() {
        let (_, apps) = parse_sample(&CliOverrides::default());
        let names: Vec<_> = apps.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["streamer", "encoder"]);
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliOverrides {
            daemonize: false,
            time_lapse: Some(5),
            mail_addresses: Some("admin@example.com".into()),
        };
        let (settings, _) = parse_sample(&cli);
        assert_eq!(settings.poll_interval, Duration::from_secs(5));
        assert_eq!(settings.alert_recipients, vec!["admin@example.com".to_string()]);
        // --daemonize can only switch it on.
        assert!(settings.daemonize);
    }

    #[test]
    fn test_defaults_when_absent() {
        let raw = "[main]\n[web]\ncommand = \"nginx\"\n";
        let (settings, apps) =
            parse(&CliOverrides::default(), Path::new("x.toml"), raw).unwrap();
        assert_eq!(settings.poll_interval, Duration::from_secs(DEFAULT_TIME_LAPSE_S));
        assert!(!settings.daemonize);
        assert!(settings.alert_recipients.is_empty());

        let web = &apps[0];
        assert_eq!(web.process_name, "web");
        assert!(web.arguments.is_empty());
        assert_eq!(web.restart_cooldown, Duration::from_secs(DEFAULT_COOLDOWN_S));
        assert_eq!(web.max_restarts_per_window, DEFAULT_MAX_RESTARTS);
    }

    #[test]
    fn test_app_options() {
        let (_, apps) = parse_sample(&CliOverrides::default());
        let streamer = &apps[0];
        assert_eq!(streamer.arguments, ["--port", "9000", "--name", "edge one"]);

        let encoder = &apps[1];
        assert_eq!(encoder.process_name, "enc");
        assert_eq!(encoder.restart_cooldown, Duration::from_secs(5));
        assert_eq!(encoder.max_restarts_per_window, 2);
        assert_eq!(encoder.restart_window, Duration::from_secs(120));
    }

    #[test]
    fn test_probe_timeout_clamped_to_poll_interval() {
        let raw = "[main]\ntime-lapse = 2\nprobe-timeout = 10\n[a]\ncommand = \"a\"\n";
        let (settings, _) = parse(&CliOverrides::default(), Path::new("x"), raw).unwrap();
        assert_eq!(settings.probe_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_address_array_is_accepted() {
        let raw = "[main]\nmail-addresses = [\"a@x.org\", \"b@x.org, a@x.org\"]\n[a]\ncommand = \"a\"\n";
        let (settings, _) = parse(&CliOverrides::default(), Path::new("x"), raw).unwrap();
        assert_eq!(settings.alert_recipients, ["a@x.org", "b@x.org"]);
    }

    #[test]
    fn test_missing_main_is_rejected() {
        let raw = "[web]\ncommand = \"nginx\"\n";
        let err = parse(&CliOverrides::default(), Path::new("x"), raw).unwrap_err();
        assert!(matches!(err, ConfigError::MissingMain));
    }

    #[test]
    fn test_missing_command_is_rejected() {
        let raw = "[main]\n[web]\narguments = \"-g daemon\"\n";
        let err = parse(&CliOverrides::default(), Path::new("x"), raw).unwrap_err();
        assert!(matches!(err, ConfigError::MissingCommand(name) if name == "web"));
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let raw = "[main]\n[web]\ncommand = \"nginx\"\nretries = 3\n";
        let err = parse(&CliOverrides::default(), Path::new("x"), raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSection { section, .. } if section == "web"));
    }

    #[test]
    fn test_zero_time_lapse_is_rejected() {
        let cli = CliOverrides {
            time_lapse: Some(0),
            ..Default::default()
        };
        let err = parse(&cli, Path::new("x"), SAMPLE).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { option: "time-lapse", .. }));
    }

    #[test]
    fn test_bad_address_is_rejected() {
        let cli = CliOverrides {
            mail_addresses: Some("ops@example.com, nobody".into()),
            ..Default::default()
        };
        let err = parse(&cli, Path::new("x"), SAMPLE).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOption { option: "mail-addresses", .. }));
    }

    #[test]
    fn test_no_apps_is_rejected() {
        let err = parse(&CliOverrides::default(), Path::new("x"), "[main]\n").unwrap_err();
        assert!(matches!(err, ConfigError::NoApps));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let apps = vec![AppSpec::new("a", "/bin/a"), AppSpec::new("a", "/bin/b")];
        assert!(matches!(validate_apps(&apps), Err(ConfigError::DuplicateApp(n)) if n == "a"));
    }

    #[test]
    fn test_load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("procwatch.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let (settings, apps) = load(&CliOverrides::default(), &path).unwrap();
        assert_eq!(settings.config_path, path);
        assert_eq!(apps.len(), 2);
    }

    #[test]
    fn test_load_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&CliOverrides::default(), &dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }

    #[test]
    fn test_malformed_file() {
        let err = parse(&CliOverrides::default(), Path::new("x"), "[main\n").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }
}
