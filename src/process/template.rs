//! Directory-backed template storage
//!
//! Templates live at `<root>/<prefix>/<name>`. They are copied into a service
//! directory before start and receive deployments back from it. For cluster
//! deploys a template travels as a gzipped tar archive.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use super::ProcessError;
use crate::service::{ServiceDeployment, ServiceTemplate};

#[derive(Debug, Clone)]
pub struct LocalTemplateStorage {
    root: PathBuf,
}

impl LocalTemplateStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn template_dir(&self, template: &ServiceTemplate) -> PathBuf {
        self.root.join(&template.prefix).join(&template.name)
    }

    pub fn has(&self, template: &ServiceTemplate) -> bool {
        self.template_dir(template).is_dir()
    }

    pub fn create(&self, template: &ServiceTemplate) -> Result<(), ProcessError> {
        fs::create_dir_all(self.template_dir(template))?;
        Ok(())
    }

    /// Every `prefix/name` directory in the storage
    pub fn templates(&self) -> Result<Vec<ServiceTemplate>, ProcessError> {
        let mut templates = Vec::new();
        if !self.root.is_dir() {
            return Ok(templates);
        }
        for prefix in fs::read_dir(&self.root)? {
            let prefix = prefix?;
            if !prefix.file_type()?.is_dir() {
                continue;
            }
            for name in fs::read_dir(prefix.path())? {
                let name = name?;
                if name.file_type()?.is_dir() {
                    templates.push(ServiceTemplate::new(
                        prefix.file_name().to_string_lossy(),
                        name.file_name().to_string_lossy(),
                    ));
                }
            }
        }
        templates.sort_by_key(|t| t.full_name());
        Ok(templates)
    }

    /// Copy a template into `target`, overwriting existing files
    pub fn copy_to(&self, template: &ServiceTemplate, target: &Path) -> Result<(), ProcessError> {
        let source = self.template_dir(template);
        if !source.is_dir() {
            return Err(ProcessError::TemplateNotFound(template.to_string()));
        }
        debug!("Copying template {} to {}", template, target.display());
        copy_dir(&source, target, &|_| false)?;
        Ok(())
    }

    /// Copy a service directory back into the deployment's template
    pub fn deploy(&self, source: &Path, deployment: &ServiceDeployment) -> Result<(), ProcessError> {
        let target = self.template_dir(&deployment.template);
        debug!(
            "Deploying {} to template {}",
            source.display(),
            deployment.template
        );
        copy_dir(source, &target, &|relative| deployment.is_excluded(relative))?;
        Ok(())
    }

    /// Pack a template as a gzipped tar archive
    pub fn archive(&self, template: &ServiceTemplate) -> Result<Vec<u8>, ProcessError> {
        let source = self.template_dir(template);
        if !source.is_dir() {
            return Err(ProcessError::TemplateNotFound(template.to_string()));
        }

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all(".", &source)?;
        let encoder = builder.into_inner()?;
        Ok(encoder.finish()?)
    }

    /// Unpack an archive produced by [`Self::archive`] into a template
    pub fn extract(&self, template: &ServiceTemplate, archive: &[u8]) -> Result<(), ProcessError> {
        let target = self.template_dir(template);
        fs::create_dir_all(&target)?;
        tar::Archive::new(GzDecoder::new(archive)).unpack(&target)?;
        Ok(())
    }
}

/// Recursive copy; `skip` receives paths relative to `source` with `/` separators
fn copy_dir(source: &Path, target: &Path, skip: &dyn Fn(&str) -> bool) -> io::Result<()> {
    copy_dir_inner(source, source, target, skip)
}

fn copy_dir_inner(
    base: &Path,
    dir: &Path,
    target: &Path,
    skip: &dyn Fn(&str) -> bool,
) -> io::Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(base)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        if skip(&relative) {
            continue;
        }

        let destination = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_inner(base, &path, &destination, skip)?;
        } else {
            fs::copy(&path, &destination)?;
        }
    }
    Ok(())
}
