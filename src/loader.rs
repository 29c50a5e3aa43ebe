//! Definition directory access: listing, parsing by extension and writing
//! back specs accepted from peers.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use log::debug;

use crate::error::LoadError;
use crate::store::DefinitionWriter;
use crate::types::{Definition, ServiceSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionFormat {
    Yaml,
    Json,
}

impl DefinitionFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Some(Self::Yaml),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }

    fn parse(self, path: &Path, contents: &str) -> Result<Definition, LoadError> {
        let parsed = match self {
            Self::Yaml => serde_yaml::from_str(contents).map_err(|e| e.to_string()),
            Self::Json => serde_json::from_str(contents).map_err(|e| e.to_string()),
        };
        parsed.map_err(|message| LoadError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    fn render(self, definition: &Definition) -> Result<String, String> {
        match self {
            Self::Yaml => serde_yaml::to_string(definition).map_err(|e| e.to_string()),
            Self::Json => serde_json::to_string_pretty(definition).map_err(|e| e.to_string()),
        }
    }
}

/// Reads one definition file, stamping `last_updated` from its mtime.
///
/// The returned spec has been validated and its name matches the file's
/// base name.
pub fn read_definition(path: &Path) -> Result<ServiceSpec, LoadError> {
    let format =
        DefinitionFormat::from_path(path).ok_or_else(|| LoadError::UnknownExtension(path.into()))?;
    let io_err = |source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let contents = fs::read_to_string(path).map_err(io_err)?;
    let modified = fs::metadata(path).and_then(|m| m.modified()).map_err(io_err)?;

    let definition = format.parse(path, &contents)?;
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    if definition.name != stem {
        return Err(LoadError::NameMismatch {
            path: path.to_path_buf(),
            name: definition.name,
        });
    }

    let spec = definition.into_spec(DateTime::<Utc>::from(modified));
    spec.validate().map_err(|source| LoadError::Invalid {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(spec)
}

/// The directory holding one definition file per service.
#[derive(Debug, Clone)]
pub struct DefinitionDir {
    root: PathBuf,
}

impl DefinitionDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Regular files in the directory, sorted by name.
    pub fn entries(&self) -> Result<Vec<PathBuf>, LoadError> {
        let read_dir = fs::read_dir(&self.root).map_err(|source| LoadError::ReadDir {
            path: self.root.clone(),
            source,
        })?;
        let mut paths = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| LoadError::ReadDir {
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Existing file for `name` in any supported format.
    fn existing_file(&self, name: &str) -> Option<(PathBuf, DefinitionFormat)> {
        ["yml", "yaml", "json"].iter().find_map(|ext| {
            let path = self.root.join(format!("{}.{}", name, ext));
            let format = DefinitionFormat::from_path(&path)?;
            path.is_file().then_some((path, format))
        })
    }
}

impl DefinitionWriter for DefinitionDir {
    fn persist(&self, spec: &ServiceSpec) -> Result<(), LoadError> {
        let (path, format) = self
            .existing_file(&spec.name)
            .unwrap_or_else(|| (self.root.join(format!("{}.yml", spec.name)), DefinitionFormat::Yaml));
        let rendered = format
            .render(&Definition::from(spec))
            .map_err(|message| LoadError::Parse {
                path: path.clone(),
                message,
            })?;
        let io_err = |source| LoadError::Io {
            path: path.clone(),
            source,
        };
        fs::write(&path, rendered).map_err(io_err)?;
        // The mtime is the freshness marker LOAD reads back.
        fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(SystemTime::from(spec.last_updated)))
            .map_err(io_err)?;
        debug!("Wrote definition for {} to {}", spec.name, path.display());
        Ok(())
    }
}
