//! Google Drive v3 backend.
//!
//! Drive has no hierarchical keys: every object is a file directly inside
//! `folder_id`, named after its full normalized path.

use std::fmt;
use std::io::Read;

use serde::{Deserialize, Serialize};
use url::Url;

use super::path::{dir_prefix, join, object_path, strip_base};
use super::remote::{self, RemoteObject, ResumableUpload};
use super::{FileInfo, Object, ObjectStorage, StorageType, UrlParams, VisitFn};
use crate::{Error, Result};

const FILE_FIELDS: &str = "id,name,size,modifiedTime";

fn default_endpoint() -> String {
    "https://www.googleapis.com".into()
}

fn default_chunk_size() -> usize {
    8 * 1024 * 1024
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    pub folder_id: String,
    pub access_token: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl fmt::Debug for DriveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriveConfig")
            .field("folder_id", &self.folder_id)
            .field("base_path", &self.base_path)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct DriveStorage {
    agent: ureq::Agent,
    endpoint: Url,
    config: DriveConfig,
}

impl fmt::Debug for DriveStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriveStorage")
            .field("folder_id", &self.config.folder_id)
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
}

impl DriveFile {
    fn info(&self) -> FileInfo {
        FileInfo {
            name: remote::base_name(&self.name),
            size: self
                .size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            mod_time: remote::parse_rfc3339(self.modified_time.as_deref()),
            is_dir: false,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Quote a value for the Drive query language.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl DriveStorage {
    pub fn new(config: DriveConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)?;
        if config.folder_id.is_empty() {
            return Err(Error::Config("drive folder_id must be set".into()));
        }
        if config.chunk_size == 0 || config.chunk_size % (256 * 1024) != 0 {
            return Err(Error::Config(
                "drive chunk_size must be a positive multiple of 256KiB".into(),
            ));
        }
        Ok(DriveStorage {
            agent: remote::agent(),
            endpoint,
            config,
        })
    }

    fn name(&self, path: &str) -> Result<String> {
        Ok(join(&self.config.base_path, &object_path(path)?))
    }

    fn api_url(&self, path: &str, query: &[(&str, &str)]) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(path);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        url
    }

    fn request(&self, method: &str, url: &Url) -> ureq::Request {
        self.agent.request_url(method, url).set(
            "Authorization",
            &format!("Bearer {}", self.config.access_token),
        )
    }

    fn list(&self, query: &str, page_token: Option<&str>) -> Result<FileList> {
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let mut params = vec![
            ("q", query),
            ("fields", fields.as_str()),
            ("pageSize", "1000"),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        let url = self.api_url("/drive/v3/files", &params);
        Ok(self.request("GET", &url).call()?.into_json()?)
    }

    fn find(&self, name: &str) -> Result<DriveFile> {
        let query = format!(
            "name = {} and {} in parents and trashed = false",
            quote(name),
            quote(&self.config.folder_id)
        );
        self.list(&query, None)?
            .files
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotExist(name.to_string()))
    }

    fn get_from(&self, id: &str, offset: u64) -> Result<remote::Body> {
        let url = self.api_url(&format!("/drive/v3/files/{}", id), &[("alt", "media")]);
        let mut request = self.request("GET", &url);
        if offset > 0 {
            request = request.set("Range", &format!("bytes={}-", offset));
        }
        Ok(request.call()?.into_reader())
    }

    fn remote_object(&self, file: DriveFile) -> RemoteObject {
        let this = self.clone();
        let info = file.info();
        let id = file.id;
        RemoteObject::new(info, Box::new(move |offset| this.get_from(&id, offset)))
    }

    /// Open a resumable session, creating the file or replacing an
    /// existing one's content.
    fn start_session(&self, name: &str, existing: Option<&str>) -> Result<String> {
        let response = match existing {
            Some(id) => {
                let url = self.api_url(
                    &format!("/upload/drive/v3/files/{}", id),
                    &[("uploadType", "resumable")],
                );
                self.request("PATCH", &url)
                    .set("Content-Type", "application/json; charset=UTF-8")
                    .send_string("{}")?
            }
            None => {
                let url = self.api_url("/upload/drive/v3/files", &[("uploadType", "resumable")]);
                self.request("POST", &url)
                    .send_json(serde_json::json!({
                        "name": name,
                        "parents": [self.config.folder_id],
                    }))?
            }
        };
        response
            .header("Location")
            .map(str::to_string)
            .ok_or_else(|| Error::Storage("resumable upload without session URL".into()))
    }
}

impl ObjectStorage for DriveStorage {
    fn open(&self, path: &str) -> Result<Box<dyn Object>> {
        let file = self.find(&self.name(path)?)?;
        Ok(Box::new(self.remote_object(file)))
    }

    fn save(&self, path: &str, reader: &mut dyn Read, size: i64) -> Result<i64> {
        let name = self.name(path)?;
        let existing = match self.find(&name) {
            Ok(file) => Some(file.id),
            Err(e) if e.is_not_exist() => None,
            Err(e) => return Err(e),
        };
        let session = self.start_session(&name, existing.as_deref())?;
        ResumableUpload {
            agent: &self.agent,
            session: &session,
            bearer: &self.config.access_token,
            chunk_size: self.config.chunk_size,
        }
        .upload(reader, size)
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        Ok(self.find(&self.name(path)?)?.info())
    }

    fn delete(&self, path: &str) -> Result<()> {
        let file = match self.find(&self.name(path)?) {
            Ok(file) => file,
            Err(e) if e.is_not_exist() => return Ok(()),
            Err(e) => return Err(e),
        };
        let url = self.api_url(&format!("/drive/v3/files/{}", file.id), &[]);
        match self.request("DELETE", &url).call() {
            Ok(_) => Ok(()),
            Err(e) => match Error::from(e) {
                Error::NotExist(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    fn url(&self, _path: &str, _name: &str, _params: &UrlParams) -> Result<Url> {
        Err(Error::UrlNotSupported)
    }

    fn iterate_objects(&self, prefix: &str, visit: &mut VisitFn<'_>) -> Result<()> {
        let name_prefix = dir_prefix(&self.config.base_path, prefix)?;
        let query = format!(
            "{} in parents and trashed = false",
            quote(&self.config.folder_id)
        );
        let mut token: Option<String> = None;

        loop {
            let page = self.list(&query, token.as_deref())?;
            let mut files: Vec<DriveFile> = page
                .files
                .into_iter()
                .filter(|f| f.name.starts_with(&name_prefix))
                .collect();
            files.sort_by(|a, b| a.name.cmp(&b.name));

            for file in files {
                let rel = strip_base(&self.config.base_path, &file.name).to_string();
                let mut object = self.remote_object(file);
                visit(&rel, &mut object)?;
            }

            match page.next_page_token {
                Some(next) => token = Some(next),
                None => return Ok(()),
            }
        }
    }

    fn kind(&self) -> StorageType {
        StorageType::Drive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DriveConfig {
        DriveConfig {
            folder_id: "folder123".into(),
            access_token: "token".into(),
            base_path: String::new(),
            endpoint: default_endpoint(),
            chunk_size: default_chunk_size(),
        }
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("a'b\\c"), r"'a\'b\\c'");
    }

    #[test]
    fn test_url_not_supported() {
        let s = DriveStorage::new(config()).unwrap();
        assert!(matches!(
            s.url("ab/cd/ef", "f", &UrlParams::default()),
            Err(Error::UrlNotSupported)
        ));
    }

    #[test]
    fn test_requires_folder() {
        let err = DriveStorage::new(DriveConfig {
            folder_id: String::new(),
            ..config()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_file_info_uses_base_name() {
        let file: DriveFile = serde_json::from_str(
            r#"{"id":"1","name":"tmp7/0-9.chunk","size":"10","modifiedTime":"2024-05-06T07:08:09Z"}"#,
        )
        .unwrap();
        let info = file.info();
        assert_eq!(info.name, "0-9.chunk");
        assert_eq!(info.size, 10);
    }
}
