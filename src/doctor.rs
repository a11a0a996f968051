use std::path::Path;

use anyhow::Result;

use crate::config::{AgentSource, RuntimeConfig, display_path, load_agent_definitions};
use crate::workflow::load_templates;

#[derive(Debug, Clone, PartialEq)]
pub struct DoctorCheck {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, detail: String) -> Self {
        Self {
            name,
            ok: true,
            detail,
        }
    }

    fn fail(name: &'static str, err: &anyhow::Error) -> Self {
        Self {
            name,
            ok: false,
            detail: format!("{err:#}"),
        }
    }
}

fn check_writable_dir(dir: &str) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = Path::new(dir).join(".doctor-probe");
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

pub fn collect_doctor_checks(cfg: &RuntimeConfig) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();

    checks.push(match load_agent_definitions(cfg) {
        Ok(definitions) => {
            let count = |source: AgentSource| {
                definitions
                    .iter()
                    .filter(|definition| definition.source == source)
                    .count()
            };
            let enabled = definitions.iter().filter(|definition| definition.enabled).count();
            DoctorCheck::pass(
                "agent catalog",
                format!(
                    "{} agents ({} enabled; implicit={} global={} local={})",
                    definitions.len(),
                    enabled,
                    count(AgentSource::Implicit),
                    count(AgentSource::Global),
                    count(AgentSource::Local)
                ),
            )
        }
        Err(err) => DoctorCheck::fail("agent catalog", &err),
    });

    checks.push(match load_templates(Path::new(&cfg.workflow_catalog_path)) {
        Ok(templates) => {
            let custom = templates.values().filter(|template| !template.builtin).count();
            DoctorCheck::pass(
                "workflow catalog",
                format!(
                    "{} templates ({} built-in, {} from catalog)",
                    templates.len(),
                    templates.len() - custom,
                    custom
                ),
            )
        }
        Err(err) => DoctorCheck::fail("workflow catalog", &err),
    });

    for (name, dir) in [("state dir", &cfg.state_dir), ("output dir", &cfg.output_dir)] {
        checks.push(match check_writable_dir(dir) {
            Ok(()) => DoctorCheck::pass(name, format!("{} is writable", display_path(cfg, dir))),
            Err(err) => DoctorCheck::fail(
                name,
                &err.context(format!("{} is not writable", display_path(cfg, dir))),
            ),
        });
    }

    if let Some(identity_file) = &cfg.identity_file {
        checks.push(if Path::new(identity_file).is_file() {
            DoctorCheck::pass("identity file", display_path(cfg, identity_file))
        } else {
            DoctorCheck::fail(
                "identity file",
                &anyhow::anyhow!("identity file '{}' not found", display_path(cfg, identity_file)),
            )
        });
    }

    checks
}

pub fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile,
        display_path(cfg, &cfg.config_path)
    );

    let checks = collect_doctor_checks(cfg);
    for check in &checks {
        let status = if check.ok { "ok" } else { "FAILED" };
        println!("- {}: {status} ({})", check.name, check.detail);
    }
    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled,
        display_path(cfg, &cfg.telemetry_path)
    );

    let failed = checks.iter().filter(|check| !check.ok).count();
    if failed > 0 {
        return Err(anyhow::anyhow!(
            "doctor found {failed} failing check(s); see output above"
        ));
    }
    Ok(())
}
