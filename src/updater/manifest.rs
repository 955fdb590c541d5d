//! 更新清单解析与本地缓存
//!
//! 清单格式为 `{"response": [...]}` 或直接为数组。任何一个条目无效都会拒绝整个清单，
//! 此时缓存和记录表保持不变。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use super::record::PackageType;
use super::verifier::ChecksumAlgorithm;
use crate::error::{UpdaterError, UpdaterResult};

/// 清单条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    pub version: String,
    /// 构建时间（unix 秒）
    #[serde(alias = "datetime")]
    pub timestamp: i64,
    pub url: String,
    pub size: u64,
    pub checksum: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_type: Option<PackageType>,
}

impl ManifestEntry {
    /// 本地文件名，缺省为 `<id>.zip`
    pub fn file_name(&self) -> String {
        self.filename
            .clone()
            .unwrap_or_else(|| format!("{}.zip", self.id))
    }

    fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("id 为空".to_string());
        }
        if !is_safe_file_name(&self.id) {
            return Err(format!("id 含非法字符: {}", self.id));
        }
        if let Some(name) = &self.filename {
            if !is_safe_file_name(name) {
                return Err(format!("{}: filename 非法: {}", self.id, name));
            }
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(format!("{}: 下载地址无效: {}", self.id, self.url));
        }
        if self.size == 0 {
            return Err(format!("{}: 文件大小为 0", self.id));
        }
        if ChecksumAlgorithm::from_hex(&self.checksum).is_none() {
            return Err(format!("{}: 校验和格式无效", self.id));
        }
        Ok(())
    }
}

fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestDocument {
    Wrapped { response: Vec<ManifestEntry> },
    Bare(Vec<ManifestEntry>),
}

/// 解析清单内容
pub fn parse_manifest(content: &[u8]) -> UpdaterResult<Vec<ManifestEntry>> {
    let document: ManifestDocument = serde_json::from_slice(content)
        .map_err(|e| UpdaterError::ManifestParseFailure(e.to_string()))?;
    let entries = match document {
        ManifestDocument::Wrapped { response } => response,
        ManifestDocument::Bare(entries) => entries,
    };

    let mut seen = HashSet::new();
    let mut files = HashSet::new();
    for entry in &entries {
        entry.validate().map_err(UpdaterError::ManifestParseFailure)?;
        if !seen.insert(entry.id.as_str()) {
            return Err(UpdaterError::ManifestParseFailure(format!(
                "重复的更新 id: {}",
                entry.id
            )));
        }
        // 不同的更新不能共用同一个本地文件
        let file_name = entry.file_name();
        if !files.insert(file_name.clone()) {
            return Err(UpdaterError::ManifestParseFailure(format!(
                "重复的文件名: {} (id={})",
                file_name, entry.id
            )));
        }
    }

    debug!("清单解析完成: {} 个更新", entries.len());
    Ok(entries)
}

/// 最近一次成功获取的清单缓存
#[derive(Debug, Clone)]
pub struct ManifestCache {
    path: PathBuf,
}

impl ManifestCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 新下载清单使用的临时文件（与缓存同目录，便于原子替换）
    pub fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "updates.json".to_string());
        self.path
            .with_file_name(format!("{}.{}.tmp", name, Uuid::new_v4()))
    }

    /// 读取缓存清单，不存在或无效时返回 None
    pub async fn load(&self) -> Option<Vec<ManifestEntry>> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("读取清单缓存失败: {:?}, 错误: {}", self.path, e);
                }
                return None;
            }
        };

        match parse_manifest(&content) {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!("清单缓存无效，已忽略: {}", e);
                None
            }
        }
    }

    /// 用新下载的临时文件替换缓存
    pub async fn replace_with(&self, temp_path: &Path) -> UpdaterResult<()> {
        fs::rename(temp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MD5: &str = "9e107d9d372bb6826bd81d3542a419d6";

    fn manifest_json() -> String {
        format!(
            r#"{{"response":[
                {{"id":"a","version":"14.0","datetime":1700000000,"url":"https://ota.example.org/a.zip","size":1000,"checksum":"{md5}"}},
                {{"id":"b","version":"14.1","timestamp":1700100000,"url":"https://ota.example.org/b.zip","size":2000,"checksum":"{md5}","filename":"b-signed.zip","package_type":"ab"}}
            ]}}"#,
            md5 = MD5
        )
    }

    #[test]
    fn test_parse_wrapped_manifest() {
        let entries = parse_manifest(manifest_json().as_bytes()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].timestamp, 1_700_000_000);
        assert_eq!(entries[0].file_name(), "a.zip");
        assert_eq!(entries[1].file_name(), "b-signed.zip");
        assert_eq!(entries[1].package_type, Some(PackageType::Ab));
    }

    #[test]
    fn test_parse_bare_array() {
        let json = format!(
            r#"[{{"id":"a","version":"1","timestamp":1,"url":"http://h/a","size":1,"checksum":"{}"}}]"#,
            MD5
        );
        assert_eq!(parse_manifest(json.as_bytes()).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_entry_rejects_whole_manifest() {
        let json = format!(
            r#"[{{"id":"a","version":"1","timestamp":1,"url":"http://h/a","size":1,"checksum":"{}"}},
                {{"id":"b","version":"1","timestamp":1,"url":"http://h/b","size":1,"checksum":"xyz"}}]"#,
            MD5
        );
        assert!(matches!(
            parse_manifest(json.as_bytes()),
            Err(UpdaterError::ManifestParseFailure(_))
        ));
    }

    #[test]
    fn test_rejects_unsafe_names_and_duplicates() {
        let traversal = format!(
            r#"[{{"id":"../etc","version":"1","timestamp":1,"url":"http://h/a","size":1,"checksum":"{}"}}]"#,
            MD5
        );
        assert!(parse_manifest(traversal.as_bytes()).is_err());

        let dup = format!(
            r#"[{{"id":"a","version":"1","timestamp":1,"url":"http://h/a","size":1,"checksum":"{m}"}},
                {{"id":"a","version":"2","timestamp":2,"url":"http://h/a","size":1,"checksum":"{m}"}}]"#,
            m = MD5
        );
        assert!(parse_manifest(dup.as_bytes()).is_err());

        assert!(parse_manifest(b"<html>").is_err());
    }

    #[test]
    fn test_rejects_shared_file_name() {
        // b 显式使用 a 的默认文件名
        let shared = format!(
            r#"[{{"id":"a","version":"1","timestamp":1,"url":"http://h/a","size":1,"checksum":"{m}"}},
                {{"id":"b","version":"2","timestamp":2,"url":"http://h/b","size":1,"checksum":"{m}","filename":"a.zip"}}]"#,
            m = MD5
        );
        let err = parse_manifest(shared.as_bytes()).unwrap_err();
        assert!(matches!(err, UpdaterError::ManifestParseFailure(ref msg) if msg.contains("a.zip")));

        let explicit = format!(
            r#"[{{"id":"a","version":"1","timestamp":1,"url":"http://h/a","size":1,"checksum":"{m}","filename":"ota.zip"}},
                {{"id":"b","version":"2","timestamp":2,"url":"http://h/b","size":1,"checksum":"{m}","filename":"ota.zip"}}]"#,
            m = MD5
        );
        assert!(matches!(
            parse_manifest(explicit.as_bytes()),
            Err(UpdaterError::ManifestParseFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_replace_and_load() {
        let dir = TempDir::new().unwrap();
        let cache = ManifestCache::new(dir.path().join("updates.json"));
        assert!(cache.load().await.is_none());

        let temp = cache.temp_path();
        assert_ne!(temp, cache.temp_path());
        fs::write(&temp, manifest_json()).await.unwrap();
        cache.replace_with(&temp).await.unwrap();

        assert!(!temp.exists());
        assert_eq!(cache.load().await.unwrap().len(), 2);
    }
}
