use super::paths::encode_project_path;
use super::types::Project;
use super::HistoryError;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::Path;

/// Projects the agent knows about that also have a log directory.
///
/// Project paths are the keys of the `projects` object in the agent's
/// config file. A missing config file means no projects.
pub fn list_projects(
    agent_config_path: &Path,
    projects_dir: &Path,
) -> Result<Vec<Project>, HistoryError> {
    let contents = match fs::read_to_string(agent_config_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!("No agent config at {}", agent_config_path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(HistoryError::from_io(agent_config_path, e)),
    };

    let config: Value = serde_json::from_str(&contents).map_err(|e| HistoryError::Io {
        path: agent_config_path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })?;

    let Some(known) = config.get("projects").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };

    let projects = known
        .keys()
        .filter_map(|path| {
            let encoded_name = encode_project_path(path);
            if encoded_name.is_empty() || !projects_dir.join(&encoded_name).is_dir() {
                return None;
            }
            Some(Project {
                path: path.clone(),
                encoded_name,
            })
        })
        .collect();
    Ok(projects)
}
