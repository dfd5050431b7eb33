//! HarborConfig - 콘솔 엔진 통합 설정
//!
//! ```json
//! {
//!   "dataDir": "./data",
//!   "workers": 4,
//!   "maxUploadSizeMb": 2048,
//!   "bind": "127.0.0.1:8080"
//! }
//! ```

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 설정 파일 이름
pub const HARBOR_CONFIG_FILE: &str = "config.json";

/// 기본 워커 수
pub const DEFAULT_WORKERS: usize = 4;

/// 기본 forward-auth 헤더
pub const DEFAULT_ACTOR_HEADER: &str = "x-forwarded-user";

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_MAX_UPLOAD_SIZE_MB: u64 = 2048;
const DEFAULT_BIND: &str = "127.0.0.1:8080";

/// Harbor 통합 설정
///
/// 경로 필드가 비어 있으면 `data_dir` 아래 기본 위치를 사용한다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarborConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_log_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspaces_dir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stacks_dir: Option<PathBuf>,

    /// 동시 실행 워커 수
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// 대기열 상한 (없으면 무제한)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queued: Option<usize>,

    /// URL 다운로드 최대 크기 (MB)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_upload_size_mb: Option<u64>,

    /// 컨테이너 런타임 주소 (unix:// 또는 tcp://). 없으면 로컬 기본값
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_host: Option<String>,

    /// HTTP 바인딩 주소
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// 요청자 식별 헤더
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_header: Option<String>,

    /// 작업 네트워크 프록시 (http, https, socks5, socks5h). git, compose, URL 다운로드에 적용
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

impl HarborConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 글로벌 + 프로젝트 + 환경 변수 순으로 로드
    pub fn load() -> Result<Self> {
        let mut config = Self::new();

        // 1. 글로벌 설정
        if let Ok(global) = JsonStore::global() {
            if let Some(global_config) = global.load_optional::<HarborConfig>(HARBOR_CONFIG_FILE)? {
                config.merge(global_config);
            }
        }

        // 2. 프로젝트 설정
        if let Ok(project) = JsonStore::current_project() {
            if let Some(project_config) =
                project.load_optional::<HarborConfig>(HARBOR_CONFIG_FILE)?
            {
                config.merge(project_config);
            }
        }

        // 3. 환경 변수
        config.apply_env(|key| std::env::var(key).ok())?;

        Ok(config)
    }

    /// 다른 설정으로 덮어쓰기 (Some 값만)
    pub fn merge(&mut self, other: HarborConfig) {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(
                    if other.$field.is_some() {
                        self.$field = other.$field;
                    }
                )*
            };
        }

        take!(
            data_dir,
            database_path,
            task_log_dir,
            export_dir,
            upload_dir,
            workspaces_dir,
            stacks_dir,
            workers,
            max_queued,
            max_upload_size_mb,
            docker_host,
            bind,
            actor_header,
            proxy_url,
        );
    }

    /// `HARBOR_*` 환경 변수 적용
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path = |key: &str| lookup(key).filter(|v| !v.is_empty()).map(PathBuf::from);

        if let Some(v) = path("HARBOR_DATA_DIR") {
            self.data_dir = Some(v);
        }
        if let Some(v) = path("HARBOR_DATABASE_PATH") {
            self.database_path = Some(v);
        }
        if let Some(v) = path("HARBOR_TASK_LOG_DIR") {
            self.task_log_dir = Some(v);
        }
        if let Some(v) = path("HARBOR_EXPORT_DIR") {
            self.export_dir = Some(v);
        }
        if let Some(v) = path("HARBOR_UPLOAD_DIR") {
            self.upload_dir = Some(v);
        }
        if let Some(v) = path("HARBOR_WORKSPACES_DIR") {
            self.workspaces_dir = Some(v);
        }
        if let Some(v) = path("HARBOR_STACKS_DIR") {
            self.stacks_dir = Some(v);
        }

        if let Some(v) = lookup("HARBOR_WORKERS") {
            self.workers = Some(parse_number("HARBOR_WORKERS", &v)?);
        }
        if let Some(v) = lookup("HARBOR_MAX_QUEUED") {
            self.max_queued = Some(parse_number("HARBOR_MAX_QUEUED", &v)?);
        }
        if let Some(v) = lookup("HARBOR_MAX_UPLOAD_SIZE_MB") {
            self.max_upload_size_mb = Some(parse_number("HARBOR_MAX_UPLOAD_SIZE_MB", &v)?);
        }

        if let Some(v) = lookup("HARBOR_DOCKER_HOST").filter(|v| !v.is_empty()) {
            self.docker_host = Some(v);
        }
        if let Some(v) = lookup("HARBOR_BIND").filter(|v| !v.is_empty()) {
            self.bind = Some(v);
        }
        if let Some(v) = lookup("HARBOR_ACTOR_HEADER").filter(|v| !v.is_empty()) {
            self.actor_header = Some(v);
        }
        if let Some(v) = lookup("HARBOR_PROXY_URL").filter(|v| !v.trim().is_empty()) {
            self.proxy_url = Some(v);
        }

        Ok(())
    }

    /// 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.workers() == 0 {
            return Err(Error::Config("workers must be at least 1".to_string()));
        }
        if self.max_queued == Some(0) {
            return Err(Error::Config("maxQueued must be at least 1".to_string()));
        }
        if self.max_upload_size_mb() == 0 {
            return Err(Error::Config(
                "maxUploadSizeMb must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    // ========== Resolved Accessors ==========

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("harbor.db"))
    }

    pub fn task_log_dir(&self) -> PathBuf {
        self.task_log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("task-logs"))
    }

    pub fn export_dir(&self) -> PathBuf {
        self.export_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("exports"))
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("uploads"))
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.workspaces_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("workspaces"))
    }

    pub fn stacks_dir(&self) -> PathBuf {
        self.stacks_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("stacks"))
    }

    pub fn workers(&self) -> usize {
        self.workers.unwrap_or(DEFAULT_WORKERS)
    }

    pub fn max_upload_size_mb(&self) -> u64 {
        self.max_upload_size_mb
            .unwrap_or(DEFAULT_MAX_UPLOAD_SIZE_MB)
    }

    pub fn max_upload_size_bytes(&self) -> u64 {
        self.max_upload_size_mb().saturating_mul(1024 * 1024)
    }

    pub fn bind(&self) -> String {
        self.bind.clone().unwrap_or_else(|| DEFAULT_BIND.to_string())
    }

    pub fn actor_header(&self) -> String {
        self.actor_header
            .clone()
            .unwrap_or_else(|| DEFAULT_ACTOR_HEADER.to_string())
            .to_ascii_lowercase()
    }

    /// 비어 있으면 `None`
    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// 작업 디렉토리 생성
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.data_dir(),
            self.task_log_dir(),
            self.export_dir(),
            self.upload_dir(),
            self.workspaces_dir(),
            self.stacks_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                Error::Config(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a number, got '{}'", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_resolve_under_data_dir() {
        let config = HarborConfig::default();
        assert_eq!(config.workers(), 4);
        assert_eq!(config.max_upload_size_mb(), 2048);
        assert_eq!(config.task_log_dir(), PathBuf::from("./data/task-logs"));
        assert_eq!(config.export_dir(), PathBuf::from("./data/exports"));
        assert_eq!(config.actor_header(), "x-forwarded-user");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_merge_only_overrides_set_fields() {
        let mut base = HarborConfig {
            workers: Some(8),
            bind: Some("0.0.0.0:9000".to_string()),
            ..Default::default()
        };
        base.merge(HarborConfig {
            workers: Some(2),
            ..Default::default()
        });

        assert_eq!(base.workers(), 2);
        assert_eq!(base.bind(), "0.0.0.0:9000");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("HARBOR_DATA_DIR", "/srv/harbor"),
            ("HARBOR_WORKERS", "6"),
            ("HARBOR_EXPORT_DIR", "/mnt/exports"),
        ]
        .into_iter()
        .collect();

        let mut config = HarborConfig::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.workers(), 6);
        assert_eq!(config.database_path(), PathBuf::from("/srv/harbor/harbor.db"));
        assert_eq!(config.export_dir(), PathBuf::from("/mnt/exports"));
    }

    #[test]
    fn test_env_rejects_garbage_numbers() {
        let mut config = HarborConfig::default();
        let err = config
            .apply_env(|k| (k == "HARBOR_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_zero_workers_invalid() {
        let config = HarborConfig {
            workers: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_camel_case_roundtrip() {
        let json = r#"{"taskLogDir":"/logs","maxQueued":10,"proxyUrl":" 10.0.0.1:3128 "}"#;
        let config: HarborConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.task_log_dir(), PathBuf::from("/logs"));
        assert_eq!(config.max_queued, Some(10));
        assert_eq!(config.proxy_url(), Some("10.0.0.1:3128"));
    }

    #[test]
    fn test_proxy_from_env_and_blank_value() {
        let mut config = HarborConfig::default();
        config
            .apply_env(|k| (k == "HARBOR_PROXY_URL").then(|| "http://proxy:8080".to_string()))
            .unwrap();
        assert_eq!(config.proxy_url(), Some("http://proxy:8080"));

        let blank = HarborConfig {
            proxy_url: Some("   ".to_string()),
            ..Default::default()
        };
        assert_eq!(blank.proxy_url(), None);
    }
}
