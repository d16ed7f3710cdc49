use std::path::PathBuf;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::engine::context::ProjectPaths;
use crate::error::{Error, Result};
use crate::process::LogSink;
use crate::store::project::{
    format_env, EnvEntryUpdate, EnvList, ProjectRecord, ProjectUpdate, Runtime, Target,
};
use crate::store::users::User;
use crate::validate;
use crate::vcs;

use super::auth::AuthUser;
use super::AppState;

/// Reads are visible to the owner and the admin; everyone else sees a 404
/// so probing cannot reveal which projects exist.
fn authorize(project: &ProjectRecord, user: &User) -> Result<()> {
    if user.admin || project.owner_id == user.id {
        Ok(())
    } else {
        Err(Error::NotFound(format!("project '{}'", project.id)))
    }
}

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cfg = state.engine.config();
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "config": {
            "projectsDir": cfg.projects_dir,
            "logsDir": cfg.logs_dir,
            "buildDir": cfg.build_dir,
            "nginxRoot": cfg.nginx_root,
            "maxConcurrentDeploys": cfg.max_concurrent_deploys,
            "maxQueueSize": cfg.max_queue_size,
            "secretsConfigured": state.engine.codec().is_configured(),
        },
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub repo_url: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub build_output: Option<String>,
    #[serde(default)]
    pub runtime: Option<Runtime>,
    #[serde(default)]
    pub deploy_path: Option<PathBuf>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub target: Option<Target>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub env: Option<Vec<EnvEntryUpdate>>,
}

fn derive_project_id(repo_url: &str) -> Result<String> {
    let name = repo_url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_lowercase()
        .replace('_', "-");
    if name.is_empty() {
        return Err(Error::Validation(format!(
            "cannot derive a project id from '{repo_url}'"
        )));
    }
    Ok(name)
}

/// Register a project and clone its repository once, shallowly. Nothing is
/// kept if the clone fails.
pub async fn import_project(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<ImportRequest>,
) -> Result<(StatusCode, Json<ProjectRecord>)> {
    let engine = &state.engine;
    let cfg = engine.config();

    validate::repo_url(&req.repo_url)?;
    let id = match &req.project_id {
        Some(id) => id.clone(),
        None => derive_project_id(&req.repo_url)?,
    };
    validate::project_id(&id)?;

    let branch = req.branch.clone().unwrap_or_else(|| "main".to_string());
    validate::branch(&branch)?;

    let deploy_path = req
        .deploy_path
        .clone()
        .unwrap_or_else(|| cfg.nginx_root.join(&id));
    let deploy_path = validate::deploy_path(&deploy_path, &cfg.nginx_root)?;

    let build_output = req
        .build_output
        .clone()
        .unwrap_or_else(|| cfg.default_build_output.clone());
    validate::build_output(&build_output, &engine.projects().repo_dir(&id))?;

    if !user.admin && req.template_id.is_none() {
        return Err(Error::Validation(
            "projects must reference a command template".into(),
        ));
    }
    if let Some(template_id) = &req.template_id {
        engine.templates().get(template_id)?;
    }

    let env = match &req.env {
        Some(entries) => {
            validate::env_update(&EnvList::default(), entries)?;
            format_env(&EnvList::default(), entries, engine.codec())?
        }
        None => EnvList::default(),
    };

    if engine.projects().exists(&id) {
        return Err(Error::ProjectExists(id));
    }

    let record = ProjectRecord {
        id: id.clone(),
        repo: req.repo_url.clone(),
        branch,
        build_command: req.build_command.clone(),
        install_command: req.install_command.clone(),
        test_command: req.test_command.clone(),
        start_command: req.start_command.clone(),
        build_output,
        runtime: req.runtime.unwrap_or(Runtime::Static),
        deploy_path,
        domain: req.domain.clone(),
        port: req.port,
        target: req.target.unwrap_or(Target::Server),
        owner_id: user.id.clone(),
        template_id: req.template_id.clone(),
        env,
        runtime_port: None,
        last_deploy: None,
        last_commit: None,
        created_at: Utc::now(),
    };
    engine.projects().create(&record)?;

    let paths = ProjectPaths::new(cfg, &id);
    let sink = LogSink::open(&paths.import_log()).await?;
    if let Err(err) = vcs::clone_shallow(&record.repo, &record.branch, &paths.repo_dir(), &sink).await
    {
        let _ = std::fs::remove_dir_all(paths.root());
        return Err(err);
    }

    Ok((StatusCode::CREATED, Json(record.public_view())))
}

pub async fn list_projects(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<ProjectRecord>>> {
    let projects = state
        .engine
        .projects()
        .list()?
        .into_iter()
        .filter(|p| user.admin || p.owner_id == user.id)
        .map(|p| p.public_view())
        .collect();
    Ok(Json(projects))
}

pub async fn get_project(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ProjectRecord>> {
    let project = state.engine.projects().load(&id)?;
    authorize(&project, &user)?;
    Ok(Json(project.public_view()))
}

pub async fn update_project(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(req): Json<ProjectUpdate>,
) -> Result<Json<ProjectRecord>> {
    let engine = &state.engine;
    let project = engine.projects().load(&id)?;
    authorize(&project, &user)?;

    if let Some(repo) = &req.repo {
        validate::repo_url(repo)?;
    }
    if let Some(branch) = &req.branch {
        validate::branch(branch)?;
    }
    if let Some(path) = &req.deploy_path {
        validate::deploy_path(path, &engine.config().nginx_root)?;
    }
    if let Some(output) = &req.build_output {
        validate::build_output(output, &engine.projects().repo_dir(&id))?;
    }
    if let Some(env) = &req.env {
        validate::env_update(&project.env, env)?;
    }
    if let Some(template_id) = &req.template_id {
        engine.templates().get(template_id)?;
    }

    let updated = engine.projects().apply_update(&id, &req)?;
    Ok(Json(updated.public_view()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployRequest {
    pub dry_run: bool,
}

pub async fn deploy(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(req): Json<DeployRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let project = state.engine.projects().load(&id)?;
    authorize(&project, &user)?;

    let record = state.engine.enqueue(&id, req.dry_run).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "deploymentId": record.id,
            "status": "queued",
            "projectId": id,
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list_deployments(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<crate::store::deployment::DeploymentRecord>>> {
    let project = state.engine.projects().load(&id)?;
    authorize(&project, &user)?;

    let limit = query.limit.unwrap_or(20);
    Ok(Json(state.engine.deployments().list_for_project(&id, limit)?))
}

pub async fn get_deployment(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<crate::store::deployment::DeploymentRecord>> {
    let record = state.engine.deployments().get(id).await?;
    let project = state.engine.projects().load(&record.project_id)?;
    authorize(&project, &user)?;
    Ok(Json(record))
}

/// The raw deployment log as text. A deployment whose log file has not
/// materialized yet serves an empty body rather than an error.
pub async fn get_log(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Response> {
    let record = state.engine.deployments().get(id).await?;
    let project = state.engine.projects().load(&record.project_id)?;
    authorize(&project, &user)?;

    let content = std::fs::read_to_string(&record.log_path).unwrap_or_default();
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        content,
    )
        .into_response())
}

pub async fn rollback(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let project = state.engine.projects().load(&id)?;
    authorize(&project, &user)?;

    state.engine.rollback(&id).await?;
    Ok(Json(json!({"status": "ok"})))
}
