//! Loads business profiles from a directory of JSON documents.

use std::fs;
use std::path::{Path, PathBuf};

use callquote_core::business::{BusinessProfile, ProfileError, StaticSchemaSource};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BusinessLoadError {
    #[error("could not read business directory `{path}`: {source}")]
    ReadDirectory { path: PathBuf, source: std::io::Error },
    #[error("could not read business profile `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse business profile `{path}`: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("invalid business profile `{path}`: {source}")]
    Invalid { path: PathBuf, source: ProfileError },
    #[error("business directory `{0}` contains no profiles")]
    Empty(PathBuf),
}

/// Reads every `*.json` file in `directory`, in file-name order. Any
/// unreadable or invalid profile fails the whole load.
pub fn load_business_directory(directory: &Path) -> Result<StaticSchemaSource, BusinessLoadError> {
    let entries = fs::read_dir(directory).map_err(|source| BusinessLoadError::ReadDirectory {
        path: directory.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| BusinessLoadError::ReadDirectory {
            path: directory.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut source = StaticSchemaSource::new();
    for path in paths {
        let raw = fs::read_to_string(&path)
            .map_err(|source| BusinessLoadError::ReadFile { path: path.clone(), source })?;
        let profile: BusinessProfile = serde_json::from_str(&raw)
            .map_err(|source| BusinessLoadError::Parse { path: path.clone(), source })?;
        let business_id = profile.business_id.clone();
        source
            .insert(profile)
            .map_err(|source| BusinessLoadError::Invalid { path: path.clone(), source })?;
        info!(
            event_name = "business.profile_loaded",
            business_id = %business_id,
            path = %path.display(),
            "business profile loaded"
        );
    }

    if source.is_empty() {
        return Err(BusinessLoadError::Empty(directory.to_path_buf()));
    }
    Ok(source)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use callquote_core::business::piano_moving_profile;

    use super::{load_business_directory, BusinessLoadError};

    fn write_profile(dir: &std::path::Path, file: &str, business_id: &str, number: &str) {
        let mut profile = piano_moving_profile().expect("profile");
        profile.business_id = business_id.to_string();
        profile.phone_numbers = vec![number.to_string()];
        fs::write(dir.join(file), serde_json::to_string_pretty(&profile).expect("json"))
            .expect("write profile");
    }

    #[test]
    fn loads_json_profiles_and_ignores_other_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_profile(dir.path(), "b.json", "piano_b", "+1 (555) 000-0002");
        write_profile(dir.path(), "a.json", "piano_a", "+15550000001");
        fs::write(dir.path().join("README.md"), "not a profile").expect("write readme");

        let source = load_business_directory(dir.path()).expect("load");

        assert_eq!(source.business_ids(), vec!["piano_a".to_string(), "piano_b".to_string()]);
        assert_eq!(source.routes().get("+15550000002").map(String::as_str), Some("piano_b"));
    }

    #[test]
    fn duplicate_routes_and_empty_directories_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(load_business_directory(dir.path()), Err(BusinessLoadError::Empty(_))));

        write_profile(dir.path(), "a.json", "piano_a", "+15550000001");
        write_profile(dir.path(), "b.json", "piano_b", "+15550000001");
        let error = load_business_directory(dir.path()).expect_err("duplicate route");
        assert!(matches!(error, BusinessLoadError::Invalid { .. }));
        assert!(error.to_string().contains("b.json"));
    }

    #[test]
    fn unparseable_profile_names_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("broken.json"), "{ \"business_id\": ").expect("write");

        let error = load_business_directory(dir.path()).expect_err("parse failure");
        assert!(matches!(error, BusinessLoadError::Parse { .. }));
        assert!(error.to_string().contains("broken.json"));
    }
}
