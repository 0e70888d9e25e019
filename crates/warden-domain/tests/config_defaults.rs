use warden_domain::config::Config;

#[test]
fn default_scheduler_timezone_is_warsaw() {
    let config = Config::default();
    assert_eq!(config.scheduler.default_timezone, "Europe/Warsaw");
}

#[test]
fn explicit_job_limits_parse_from_toml() {
    let toml_str = r#"
[job]
max_steps = 50
max_job_runtime_secs = 900
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.job.max_steps, 50);
    assert_eq!(config.job.max_job_runtime_secs, 900);
    // Untouched sections still get their defaults.
    assert_eq!(config.job.ask_user_timeout_secs, 300);
}
