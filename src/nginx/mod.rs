use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use minijinja::Environment;
use tempfile::NamedTempFile;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::process::{self, LogSink, RunOptions};
use crate::store::project::{ProjectRecord, Runtime};

const STATIC_TEMPLATE: &str = include_str!("../../templates/nginx-static.conf.j2");
const NODE_TEMPLATE: &str = include_str!("../../templates/nginx-node.conf.j2");

pub fn site_file_name(project_id: &str) -> String {
    format!("deployer-{project_id}.conf")
}

/// Render the server block for a project. Node projects proxy to their
/// assigned runtime port and cannot be rendered without one.
pub fn render(project: &ProjectRecord) -> Result<String> {
    let domain = project.domain.as_deref().unwrap_or("_");

    let mut env = Environment::new();
    let rendered = match project.runtime {
        Runtime::Static => {
            env.add_template("static", STATIC_TEMPLATE)
                .context("static template")?;
            let tmpl = env.get_template("static").unwrap();
            tmpl.render(minijinja::context! {
                domain => domain,
                deploy_path => project.deploy_path.display().to_string(),
            })
            .context("render static server block")?
        }
        Runtime::Node => {
            let runtime_port = project.runtime_port.ok_or_else(|| {
                Error::ConfigIncomplete(format!(
                    "project '{}' has no runtime port assigned",
                    project.id
                ))
            })?;
            env.add_template("node", NODE_TEMPLATE).context("node template")?;
            let tmpl = env.get_template("node").unwrap();
            tmpl.render(minijinja::context! {
                domain => domain,
                runtime_port => runtime_port,
            })
            .context("render node server block")?
        }
    };
    Ok(rendered)
}

/// Write the site config, enable it, then `nginx -t` and reload. In dry-run
/// nothing is written and the commands are only logged.
pub async fn install(
    cfg: &Config,
    project: &ProjectRecord,
    sink: &LogSink,
    dry_run: bool,
) -> Result<()> {
    let available = cfg.nginx_sites_available.join(site_file_name(&project.id));
    let enabled = cfg.nginx_sites_enabled.join(site_file_name(&project.id));

    if dry_run {
        sink.line(&format!(
            "[dry-run] would write nginx config {}",
            available.display()
        ))
        .await?;
    } else {
        let rendered = render(project)?;
        write_site_file(&available, &rendered)?;
        enable_site(&available, &enabled)?;
        sink.line(&format!("nginx config written to {}", available.display()))
            .await?;
    }

    let opts = RunOptions::default();
    process::run("nginx", &["-t"], &opts, sink, dry_run).await?;
    process::run("systemctl", &["reload", "nginx"], &opts, sink, dry_run).await?;
    Ok(())
}

fn write_site_file(path: &PathBuf, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .context("site file has no parent directory")?;
    std::fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(content.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// Replacing an existing link keeps re-deploys idempotent.
fn enable_site(available: &PathBuf, enabled: &PathBuf) -> Result<()> {
    if let Some(parent) = enabled.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if enabled.symlink_metadata().is_ok() {
        std::fs::remove_file(enabled)?;
    }
    std::os::unix::fs::symlink(available, enabled)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::project::{EnvList, Target, ADMIN_OWNER_ID};
    use chrono::Utc;
    use std::path::Path;

    fn project(runtime: Runtime) -> ProjectRecord {
        ProjectRecord {
            id: "site".into(),
            repo: "https://github.com/o/r".into(),
            branch: "main".into(),
            build_command: Some("npm run build".into()),
            install_command: None,
            test_command: None,
            start_command: None,
            build_output: "build".into(),
            runtime,
            deploy_path: Path::new("/var/www/site").to_path_buf(),
            domain: Some("site.example.com".into()),
            port: None,
            target: Target::Server,
            owner_id: ADMIN_OWNER_ID.into(),
            template_id: None,
            env: EnvList::default(),
            runtime_port: None,
            last_deploy: None,
            last_commit: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn static_block_serves_the_deploy_path() {
        let rendered = render(&project(Runtime::Static)).unwrap();
        assert!(rendered.contains("server_name site.example.com;"));
        assert!(rendered.contains("root /var/www/site;"));
        assert!(rendered.contains("try_files $uri /index.html;"));
    }

    #[test]
    fn missing_domain_falls_back_to_catch_all() {
        let mut p = project(Runtime::Static);
        p.domain = None;
        let rendered = render(&p).unwrap();
        assert!(rendered.contains("server_name _;"));
    }

    #[test]
    fn node_block_proxies_to_the_runtime_port() {
        let mut p = project(Runtime::Node);
        p.runtime_port = Some(4123);
        let rendered = render(&p).unwrap();
        assert!(rendered.contains("proxy_pass http://127.0.0.1:4123;"));
        assert!(rendered.contains("Upgrade $http_upgrade"));
    }

    #[test]
    fn node_block_without_port_is_incomplete() {
        let err = render(&project(Runtime::Node)).unwrap_err();
        assert!(matches!(err, Error::ConfigIncomplete(_)));
    }

    #[test]
    fn site_file_naming() {
        assert_eq!(site_file_name("p1"), "deployer-p1.conf");
    }
}
