use crate::error::{Error, Result};
use crate::local_files::{self, FileSystem};
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;

/// A named entity persisted as one YAML record per name.
pub(crate) trait ConfigEntity: Serialize + DeserializeOwned {
    fn name(&self) -> &str;
    fn set_name(&mut self, name: String);
    fn record_path(name: &str) -> Result<PathBuf>;
    fn record_dir() -> Result<PathBuf>;
    fn not_found_error(name: String) -> Error;
    fn entity_type() -> &'static str;
}

pub(crate) fn from_yaml<T: DeserializeOwned>(path: &str, raw: &str) -> Result<T> {
    serde_yml::from_str(raw).map_err(|e| Error::parse_error(path, e.to_string()))
}

pub(crate) fn to_yaml<T: Serialize>(data: &T) -> Result<String> {
    serde_yml::to_string(data)
        .map_err(|e| Error::internal_unexpected(format!("serialize record: {}", e)))
}

pub(crate) fn load<T: ConfigEntity>(name: &str) -> Result<T> {
    let path = T::record_path(name)?;
    if !path.exists() {
        return Err(T::not_found_error(name.to_string()));
    }
    let content = local_files::local().read(&path)?;
    let mut entity: T = from_yaml(&path.display().to_string(), &content)?;
    entity.set_name(name.to_string());
    Ok(entity)
}

pub(crate) fn save<T: ConfigEntity>(entity: &T) -> Result<()> {
    validate_name(entity.name(), T::entity_type())?;
    let path = T::record_path(entity.name())?;
    local_files::ensure_app_dirs()?;
    let content = to_yaml(entity)?;
    local_files::local().write(&path, &content)
}

pub(crate) fn delete<T: ConfigEntity>(name: &str) -> Result<()> {
    let path = T::record_path(name)?;
    if !path.exists() {
        return Err(T::not_found_error(name.to_string()));
    }
    local_files::local().delete(&path)
}

pub(crate) fn exists<T: ConfigEntity>(name: &str) -> bool {
    T::record_path(name).map(|p| p.exists()).unwrap_or(false)
}

pub(crate) fn list_names<T: ConfigEntity>() -> Result<Vec<String>> {
    let dir = T::record_dir()?;
    let entries = local_files::local().list(&dir)?;
    let mut names: Vec<String> = entries
        .into_iter()
        .filter(|e| e.is_yaml() && !e.is_dir)
        .filter_map(|e| e.path.file_stem().map(|s| s.to_string_lossy().to_string()))
        .collect();
    names.sort();
    Ok(names)
}

/// Names become filenames; keep them to a shell-safe slug.
pub(crate) fn validate_name(name: &str, entity_type: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !ok {
        return Err(Error::validation_invalid_argument(
            format!("{}.name", entity_type),
            "Name must be non-empty and contain only [A-Za-z0-9._-]",
            Some(name.to_string()),
            None,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation_rejects_path_traversal() {
        assert!(validate_name("alpha-1", "pipeline").is_ok());
        assert!(validate_name("a/b", "pipeline").is_err());
        assert!(validate_name("", "pipeline").is_err());
        assert!(validate_name("with space", "pipeline").is_err());
    }
}
