//! Image handlers

use super::{base_name, ensure_within, parse_params, HandlerDeps, DOWNLOAD_TIMEOUT};
use crate::registry::HandlerContext;
use crate::runtime::{BuildContext, BuildRequest, PullRequest, RegistryAuth};
use futures::StreamExt;
use harbor_foundation::{Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct PullParams {
    image: String,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    auth: Option<RegistryAuth>,
}

pub(super) async fn pull(deps: &HandlerDeps, ctx: HandlerContext, params: Value) -> Result<Value> {
    let p: PullParams = parse_params(params)?;
    let log = match p.auth.as_ref().and_then(|a| a.password.clone()) {
        Some(password) => ctx.log.with_secret(password),
        None => ctx.log.clone(),
    };

    let outcome = deps
        .runtime
        .pull_image(
            &PullRequest {
                image: p.image,
                tag: p.tag,
                auth: p.auth,
            },
            &log,
        )
        .await?;
    Ok(serde_json::to_value(outcome)?)
}

#[derive(Debug, Deserialize)]
struct BuildParams {
    tag: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    git_url: Option<String>,
    #[serde(default = "super::default_dockerfile")]
    dockerfile: String,
    #[serde(default)]
    no_cache: bool,
    #[serde(default)]
    pull: bool,
}

pub(super) async fn build(deps: &HandlerDeps, ctx: HandlerContext, params: Value) -> Result<Value> {
    let p: BuildParams = parse_params(params)?;
    let context = match (p.git_url, p.path) {
        (Some(url), _) if !url.is_empty() => BuildContext::GitUrl(url),
        (_, Some(path)) if !path.is_empty() => BuildContext::Path(PathBuf::from(path)),
        _ => {
            return Err(Error::InvalidInput(
                "path or git_url is required".to_string(),
            ))
        }
    };

    let outcome = deps
        .runtime
        .build_image(
            &BuildRequest {
                tag: p.tag,
                context,
                dockerfile: p.dockerfile,
                no_cache: p.no_cache,
                pull: p.pull,
            },
            &ctx.log,
        )
        .await?;
    Ok(serde_json::to_value(outcome)?)
}

#[derive(Debug, Deserialize)]
struct BuildUploadParams {
    tag: String,
    file_path: String,
    #[serde(default = "super::default_dockerfile")]
    dockerfile: String,
    #[serde(default)]
    no_cache: bool,
    #[serde(default)]
    pull: bool,
}

pub(super) async fn build_upload(
    deps: &HandlerDeps,
    ctx: HandlerContext,
    params: Value,
) -> Result<Value> {
    let p: BuildUploadParams = parse_params(params)?;
    let archive = ensure_within(&deps.upload_dir, Path::new(&p.file_path))?;

    let outcome = deps
        .runtime
        .build_image(
            &BuildRequest {
                tag: p.tag,
                context: BuildContext::Archive(archive.clone()),
                dockerfile: p.dockerfile,
                no_cache: p.no_cache,
                pull: p.pull,
            },
            &ctx.log,
        )
        .await;
    remove_quietly(&archive).await;
    Ok(serde_json::to_value(outcome?)?)
}

#[derive(Debug, Deserialize)]
struct LoadParams {
    file_path: String,
}

pub(super) async fn load(deps: &HandlerDeps, ctx: HandlerContext, params: Value) -> Result<Value> {
    let p: LoadParams = parse_params(params)?;
    let archive = ensure_within(&deps.upload_dir, Path::new(&p.file_path))?;

    let loaded = deps.runtime.load_image(&archive, &ctx.log).await;
    remove_quietly(&archive).await;
    Ok(json!({ "loaded": loaded? }))
}

#[derive(Debug, Deserialize)]
struct LoadUrlParams {
    url: String,
    #[serde(default)]
    auth_token: Option<String>,
}

pub(super) async fn load_url(deps: &HandlerDeps, ctx: HandlerContext, params: Value) -> Result<Value> {
    let p: LoadUrlParams = parse_params(params)?;
    let url = reqwest::Url::parse(&p.url)
        .map_err(|e| Error::InvalidInput(format!("Invalid url: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidInput(
            "Only http and https URLs are supported".to_string(),
        ));
    }
    if let Some(proxy) = deps.proxy.as_ref().filter(|p| p.is_socks()) {
        return Err(Error::InvalidInput(format!(
            "URL downloads do not support socks5 proxies ({}); use an http or https proxy",
            proxy
        )));
    }
    let log = match &p.auth_token {
        Some(token) => ctx.log.with_secret(token.clone()),
        None => ctx.log.clone(),
    };

    tokio::fs::create_dir_all(&deps.upload_dir).await?;
    let download = tokio::time::timeout(
        DOWNLOAD_TIMEOUT,
        download_archive(deps, &url, p.auth_token.as_deref(), &log),
    )
    .await
    .map_err(|_| Error::Timeout("Download timed out after 10 minutes".to_string()))?;
    let archive = download?;

    let loaded = deps.runtime.load_image(&archive, &log).await;
    remove_quietly(&archive).await;
    Ok(json!({ "loaded": loaded? }))
}

/// Stream a URL into the upload dir, enforcing the size limit
async fn download_archive(
    deps: &HandlerDeps,
    url: &reqwest::Url,
    auth_token: Option<&str>,
    log: &crate::log::TaskLogger,
) -> Result<PathBuf> {
    log.line(format!("Downloading {}", url)).await;

    let mut request = deps.http.get(url.clone());
    if let Some(token) = auth_token {
        request = request.bearer_auth(token);
    }
    let response = request
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::Http(e.to_string()))?;

    let filename = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(disposition_filename)
        .unwrap_or_else(|| url_filename(url));
    let target = deps.upload_dir.join(format!(
        "url_{}_{}",
        uuid::Uuid::new_v4().simple(),
        base_name(&filename)?
    ));

    let result = write_limited(response, &target, deps.max_download_bytes).await;
    match result {
        Ok(total) => {
            log.line(format!("Downloaded {} bytes", total)).await;
            info!(file = %target.display(), bytes = total, "Image archive downloaded");
            Ok(target)
        }
        Err(e) => {
            remove_quietly(&target).await;
            Err(e)
        }
    }
}

async fn write_limited(response: reqwest::Response, target: &Path, limit: u64) -> Result<u64> {
    let mut file = tokio::fs::File::create(target).await?;
    let mut stream = response.bytes_stream();
    let mut total: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Http(e.to_string()))?;
        total += chunk.len() as u64;
        if total > limit {
            return Err(Error::InvalidInput(format!(
                "Download exceeds size limit of {} MB",
                limit / (1024 * 1024)
            )));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(total)
}

/// Last URL path segment, forced to a `.tar` / `.tar.gz` name
fn url_filename(url: &reqwest::Url) -> String {
    let last = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or("image.tar");
    if last.ends_with(".tar") || last.ends_with(".tar.gz") {
        last.to_string()
    } else {
        format!("{}.tar", last)
    }
}

/// `attachment; filename="x.tar"` -> `x.tar`
fn disposition_filename(header: &str) -> Option<String> {
    let (_, rest) = header.split_once("filename=")?;
    let name = rest.split(';').next()?.trim().trim_matches('"').trim();
    (!name.is_empty()).then(|| name.to_string())
}

#[derive(Debug, Deserialize)]
struct SaveParams {
    image: String,
    filename: String,
}

pub(super) async fn save(deps: &HandlerDeps, ctx: HandlerContext, params: Value) -> Result<Value> {
    let p: SaveParams = parse_params(params)?;
    tokio::fs::create_dir_all(&deps.export_dir).await?;
    let output = deps.export_dir.join(base_name(&p.filename)?);

    let size = deps.runtime.save_image(&p.image, &output, &ctx.log).await?;
    Ok(json!({
        "file": output.to_string_lossy(),
        "size": size,
    }))
}

#[derive(Debug, Deserialize)]
struct RemoveParams {
    image: String,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    noprune: bool,
}

pub(super) async fn remove(deps: &HandlerDeps, ctx: HandlerContext, params: Value) -> Result<Value> {
    let p: RemoveParams = parse_params(params)?;
    ctx.log
        .line(format!("Removing image {} (force={})", p.image, p.force))
        .await;
    let deleted = deps.runtime.remove_image(&p.image, p.force, p.noprune).await?;
    Ok(json!({
        "image": p.image,
        "deleted": deleted,
    }))
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = %path.display(), error = %e, "Failed to remove temporary file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::Fixture;
    use crate::task::TaskKind;

    #[tokio::test]
    async fn test_pull_masks_registry_password() {
        let f = Fixture::new();
        let ctx = f.ctx(TaskKind::ImagePull);
        let id = ctx.task_id.clone();

        let out = pull(
            &f.deps,
            ctx,
            json!({"image": "nginx", "tag": "1.25", "auth": {"username": "u", "password": "hunter2"}}),
        )
        .await
        .unwrap();

        assert_eq!(out["target"], "nginx:1.25");
        assert_eq!(f.calls(), vec!["pull nginx:1.25"]);
        let log = f.sink.tail(&id, 10).await.unwrap();
        assert!(!log.contains("hunter2"));
    }

    #[tokio::test]
    async fn test_build_requires_context() {
        let f = Fixture::new();
        let err = build(&f.deps, f.ctx(TaskKind::ImageBuild), json!({"tag": "app:1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        build(
            &f.deps,
            f.ctx(TaskKind::ImageBuild),
            json!({"tag": "app:1", "git_url": "https://github.com/o/r.git"}),
        )
        .await
        .unwrap();
        assert!(f.calls()[0].contains("GitUrl"));
    }

    #[tokio::test]
    async fn test_load_deletes_archive() {
        let f = Fixture::new();
        let archive = f.deps.upload_dir.join("image.tar");
        std::fs::write(&archive, b"tar").unwrap();

        let out = load(
            &f.deps,
            f.ctx(TaskKind::ImageLoad),
            json!({"file_path": archive.to_string_lossy()}),
        )
        .await
        .unwrap();

        assert_eq!(out, json!({"loaded": ["app:1.0"]}));
        assert!(f.calls()[0].ends_with("exists=true"));
        assert!(!archive.exists());
    }

    #[tokio::test]
    async fn test_load_rejects_outside_upload_dir() {
        let f = Fixture::new();
        let outside = f.dir.path().join("exports").join("x.tar");
        std::fs::write(&outside, b"tar").unwrap();

        let err = load(
            &f.deps,
            f.ctx(TaskKind::ImageLoad),
            json!({"file_path": outside.to_string_lossy()}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert!(outside.exists());
    }

    #[tokio::test]
    async fn test_save_uses_basename_in_export_dir() {
        let f = Fixture::new();
        let out = save(
            &f.deps,
            f.ctx(TaskKind::ImageSave),
            json!({"image": "nginx:1.25", "filename": "../../nginx.tar"}),
        )
        .await
        .unwrap();

        let file = PathBuf::from(out["file"].as_str().unwrap());
        assert_eq!(file, f.deps.export_dir.join("nginx.tar"));
        assert_eq!(out["size"], 11);
    }

    #[tokio::test]
    async fn test_load_url_rejects_scheme() {
        let f = Fixture::new();
        let err = load_url(
            &f.deps,
            f.ctx(TaskKind::ImageLoadUrl),
            json!({"url": "file:///etc/passwd"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_load_url_rejects_socks_proxy() {
        let f = Fixture::new().with_proxy("socks5h://127.0.0.1:7890");
        let err = load_url(
            &f.deps,
            f.ctx(TaskKind::ImageLoadUrl),
            json!({"url": "https://example.com/releases/image.tar"}),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(err.to_string().to_lowercase().contains("socks"));
        assert!(f.calls().is_empty());
    }

    #[test]
    fn test_url_filename() {
        let url = reqwest::Url::parse("https://example.com/a/app.tar.gz?sig=1").unwrap();
        assert_eq!(url_filename(&url), "app.tar.gz");
        let url = reqwest::Url::parse("https://example.com/download/app").unwrap();
        assert_eq!(url_filename(&url), "app.tar");
        let url = reqwest::Url::parse("https://example.com/").unwrap();
        assert_eq!(url_filename(&url), "image.tar");
    }

    #[test]
    fn test_disposition_filename() {
        assert_eq!(
            disposition_filename("attachment; filename=\"img.tar\""),
            Some("img.tar".to_string())
        );
        assert_eq!(disposition_filename("attachment"), None);
    }
}
