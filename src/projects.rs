//! Project management and access control.
//!
//! Identity is established upstream; a request carries at most a user id
//! and display name. Access rules:
//!
//! | Action | Allowed for |
//! |--------|-------------|
//! | read, chat | public projects: anyone; private: owner and collaborators |
//! | add documents | owner and collaborators |
//! | edit project | owner only |
//!
//! A private project refuses anonymous callers with `Unauthorized` and
//! signed-in outsiders with `Forbidden`.

use chrono::Utc;
use serde::Deserialize;

use aiha_core::models::{Document, Project};
use aiha_core::store::Store;

use crate::error::{PipelineError, PipelineResult, Stage, StageExt};

/// The caller of a pipeline operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Option<String>,
    pub user_name: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            user_id: Some(id.into()),
            user_name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn require_user(&self) -> PipelineResult<&str> {
        self.id().ok_or(PipelineError::Unauthorized)
    }

    fn denied(&self, message: &str) -> PipelineError {
        match self.id() {
            None => PipelineError::Unauthorized,
            Some(_) => PipelineError::Forbidden(message.to_string()),
        }
    }
}

/// Fetch a project or fail with `NotFound`.
pub async fn load_project(store: &dyn Store, project_id: &str) -> PipelineResult<Project> {
    if project_id.trim().is_empty() {
        return Err(PipelineError::validation("Missing projectId"));
    }
    store
        .get_project(project_id)
        .await
        .stage(Stage::Storage)?
        .ok_or_else(|| PipelineError::not_found("Project not found"))
}

pub fn authorize_read(project: &Project, caller: &Identity) -> PipelineResult<()> {
    if project.can_read(caller.id()) {
        Ok(())
    } else {
        Err(caller.denied("You do not have access to this project"))
    }
}

pub fn authorize_write(project: &Project, caller: &Identity) -> PipelineResult<()> {
    if project.can_write(caller.id()) {
        Ok(())
    } else {
        Err(caller.denied("Only the owner or collaborators can add documents"))
    }
}

pub fn authorize_edit(project: &Project, caller: &Identity) -> PipelineResult<()> {
    match caller.id() {
        Some(user) if user == project.owner_id => Ok(()),
        _ => Err(caller.denied("Only the owner can edit this project")),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub collaborators: Vec<String>,
}

/// Partial update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_public: Option<bool>,
    pub collaborators: Option<Vec<String>>,
}

async fn ensure_name_free(
    store: &dyn Store,
    owner_id: &str,
    name: &str,
    except_id: Option<&str>,
) -> PipelineResult<()> {
    let existing = store
        .find_project_by_name(owner_id, name)
        .await
        .stage(Stage::Storage)?;
    match existing {
        Some(p) if Some(p.id.as_str()) != except_id => {
            Err(PipelineError::validation("Project name already exists"))
        }
        _ => Ok(()),
    }
}

pub async fn create_project(
    store: &dyn Store,
    caller: &Identity,
    input: NewProject,
) -> PipelineResult<Project> {
    let owner_id = caller.require_user()?;
    let name = input.name.trim();
    if name.is_empty() {
        return Err(PipelineError::validation("Missing project name"));
    }
    ensure_name_free(store, owner_id, name, None).await?;

    let now = Utc::now();
    let project = Project {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        description: input.description,
        owner_id: owner_id.to_string(),
        owner_name: caller.user_name.clone().unwrap_or_default(),
        is_public: input.is_public,
        collaborators: input.collaborators,
        created_at: now,
        updated_at: now,
    };
    store.insert_project(&project).await.stage(Stage::Storage)?;
    tracing::info!(project = %project.id, owner = %project.owner_id, "project created");
    Ok(project)
}

pub async fn update_project(
    store: &dyn Store,
    caller: &Identity,
    project_id: &str,
    update: ProjectUpdate,
) -> PipelineResult<Project> {
    caller.require_user()?;
    let mut project = load_project(store, project_id).await?;
    authorize_edit(&project, caller)?;

    if let Some(name) = update.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(PipelineError::validation("Project name must not be empty"));
        }
        if name != project.name {
            ensure_name_free(store, &project.owner_id, &name, Some(&project.id)).await?;
            project.name = name;
        }
    }
    if let Some(description) = update.description {
        project.description = description;
    }
    if let Some(is_public) = update.is_public {
        project.is_public = is_public;
    }
    if let Some(collaborators) = update.collaborators {
        project.collaborators = collaborators;
    }
    project.updated_at = Utc::now();

    store.update_project(&project).await.stage(Stage::Storage)?;
    Ok(project)
}

pub async fn get_project(
    store: &dyn Store,
    caller: &Identity,
    project_id: &str,
) -> PipelineResult<Project> {
    let project = load_project(store, project_id).await?;
    authorize_read(&project, caller)?;
    Ok(project)
}

/// Projects the caller can read: their own, those they collaborate on,
/// and public ones.
pub async fn list_projects(store: &dyn Store, caller: &Identity) -> PipelineResult<Vec<Project>> {
    let projects = store.list_projects().await.stage(Stage::Storage)?;
    Ok(projects
        .into_iter()
        .filter(|p| p.can_read(caller.id()))
        .collect())
}

pub async fn list_documents(
    store: &dyn Store,
    caller: &Identity,
    project_id: &str,
) -> PipelineResult<Vec<Document>> {
    let project = get_project(store, caller, project_id).await?;
    store
        .list_documents(&project.id)
        .await
        .stage(Stage::Storage)
}
