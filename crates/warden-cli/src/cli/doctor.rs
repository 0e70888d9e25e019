use warden_domain::config::{Config, ConfigSeverity};

/// Run diagnostic checks and print a summary. Returns `true` when every
/// check passes.
pub fn run(config: &Config, config_path: &str) -> bool {
    println!("warden doctor");
    println!("=============\n");

    let mut all_passed = true;

    check_config_file(config_path, &mut all_passed);
    check_config_validation(config, &mut all_passed);
    check_llm_providers(config, &mut all_passed);
    check_workspace(config, &mut all_passed);
    check_skills(config, &mut all_passed);

    println!();
    if all_passed {
        println!("All checks passed.");
    } else {
        println!("Some checks failed. Review the output above.");
    }

    all_passed
}

fn print_check(label: &str, passed: bool, detail: String) {
    let mark = if passed { "OK" } else { "FAIL" };
    println!("[{mark}] {label}: {detail}");
}

fn check_config_file(config_path: &str, all_passed: &mut bool) {
    let exists = std::path::Path::new(config_path).exists();
    print_check(
        "Config file exists",
        exists,
        if exists { config_path.to_owned() } else { format!("{config_path} not found (using defaults)") },
    );
    if !exists {
        *all_passed = false;
    }
}

fn check_config_validation(config: &Config, all_passed: &mut bool) {
    let issues = config.validate();
    let error_count = issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count();
    print_check("Config validation", error_count == 0, format!("{} issue(s)", issues.len()));
    for issue in &issues {
        println!("    {issue}");
    }
    if error_count > 0 {
        *all_passed = false;
    }
}

fn check_llm_providers(config: &Config, all_passed: &mut bool) {
    let configured = !config.llm.providers.is_empty();
    print_check(
        "LLM providers configured",
        configured,
        format!("{} provider(s)", config.llm.providers.len()),
    );
    if !configured {
        *all_passed = false;
    }
}

fn check_workspace(config: &Config, all_passed: &mut bool) {
    let exists = config.workspace.path.exists();
    print_check("Workspace directory exists", exists, config.workspace.path.display().to_string());
    if !exists {
        *all_passed = false;
    }
}

fn check_skills(config: &Config, _all_passed: &mut bool) {
    let exists = config.skills.path.exists();
    print_check(
        "Skills directory exists",
        exists,
        if exists { config.skills.path.display().to_string() } else { "not found (no skills loaded)".into() },
    );
}
