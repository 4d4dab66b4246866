//! Flist image source resolution.

use serde::{Deserialize, Serialize};

use crate::error::{TypesError, TypesResult};

/// Where a container or machine image comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FlistSource {
    /// Hub download: https://hub.example.com/user/ubuntu-22.04.flist
    Hub { url: String },
    /// Local file: file:///var/cache/images/base.flist or /abs/path.flist
    File { path: String },
}

impl FlistSource {
    pub fn parse(uri: &str) -> TypesResult<Self> {
        let source = if uri.starts_with("https://") || uri.starts_with("http://") {
            FlistSource::Hub { url: uri.to_string() }
        } else if let Some(path) = uri.strip_prefix("file://") {
            FlistSource::File { path: path.to_string() }
        } else if uri.starts_with('/') {
            FlistSource::File { path: uri.to_string() }
        } else {
            return Err(TypesError::InvalidFlist(uri.to_string()));
        };

        if !source.location().ends_with(".flist") {
            return Err(TypesError::InvalidFlist(uri.to_string()));
        }
        Ok(source)
    }

    pub fn location(&self) -> &str {
        match self {
            FlistSource::Hub { url } => url,
            FlistSource::File { path } => path,
        }
    }

    /// Image file name without directories, e.g. `ubuntu-22.04.flist`.
    pub fn file_name(&self) -> &str {
        let location = self.location();
        location.rsplit('/').next().unwrap_or(location)
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            FlistSource::Hub { .. } => "https",
            FlistSource::File { .. } => "file",
        }
    }
}
