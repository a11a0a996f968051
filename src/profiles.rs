use anyhow::Result;

use crate::config::{ProfilesFile, RuntimeConfig, display_path};

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", display_path(cfg, &cfg.config_path));
    println!("State dir: {}", display_path(cfg, &cfg.state_dir));
    println!("Output dir: {}", display_path(cfg, &cfg.output_dir));
    println!(
        "Agent catalog: {} (global: {})",
        display_path(cfg, &cfg.agent_catalog_path),
        cfg.global_agent_catalog_path
            .as_deref()
            .map(|path| display_path(cfg, path))
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!(
        "Workflow catalog: {}",
        display_path(cfg, &cfg.workflow_catalog_path)
    );
    println!(
        "Preferred system: {}",
        cfg.prefer_system.as_deref().unwrap_or("<any>")
    );
    println!(
        "Steps: timeout_secs={} retry_attempts={} retry_delay_ms={}",
        cfg.step_timeout_secs, cfg.step_retry_attempts, cfg.step_retry_delay_ms
    );
    println!("Command agent timeout secs: {}", cfg.command_timeout_secs);
    println!("Auto-fix threshold: {:.2}", cfg.auto_fix_threshold);
    println!(
        "Identity file: {}",
        cfg.identity_file
            .as_deref()
            .map(|path| display_path(cfg, path))
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled,
        display_path(cfg, &cfg.telemetry_path)
    );
    println!(
        "Service: health_interval_secs={} autosave_interval_secs={} auth={}",
        cfg.health_interval_secs,
        cfg.autosave_interval_secs,
        if cfg.server_auth_token.is_some() {
            "bearer"
        } else {
            "disabled"
        }
    );
    Ok(())
}
