//! 获取源码到临时工作目录
//!
//! - git：浅克隆 tag 或 head
//! - 归档（http/https）：下载后用 tar 解包
//! - file://：目录快照复制

use crate::descriptor::{LocationKind, Source};
use crate::error::{Error, Result};
use reqwest::{Client, StatusCode};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use url::Url;

/// 获取到的源码树，drop 时删除工作目录
#[derive(Debug)]
pub struct FetchedSource {
    _workspace: TempDir,
    root: PathBuf,
    pub revision: Option<String>,
}

impl FetchedSource {
    pub fn root(&self) -> &Path {
        &self.root
    }
}

pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("formulary/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::FetchError(format!("初始化 HTTP 客户端失败: {}", e)))?;
        Ok(Self { client })
    }

    pub async fn fetch(&self, source: &Source) -> Result<FetchedSource> {
        let workspace = tempfile::Builder::new()
            .prefix("formulary-src-")
            .tempdir()
            .map_err(|e| Error::FetchError(format!("创建临时目录失败: {}", e)))?;
        let dest = workspace.path().join("src");
        let location = source.location();

        if source.is_head() {
            log::warn!("{} 使用 head 引用，每次获取的内容可能不同", location);
        }

        let (root, revision) = match source.kind() {
            LocationKind::Git => {
                let reference = match source {
                    Source::Tag { tag, .. } => tag.as_deref(),
                    Source::Head { branch, .. } => branch.as_deref(),
                };
                let revision = clone_git(location, reference, &dest)?;
                (dest, revision)
            }
            LocationKind::Archive => {
                let archive = self.download(location, workspace.path()).await?;
                extract_archive(&archive, &dest)?;
                (single_top_level_dir(&dest), None)
            }
            LocationKind::Local => {
                let path = location
                    .to_file_path()
                    .map_err(|_| Error::InvalidSource(format!("无效的本地路径 {}", location)))?;
                if !path.exists() {
                    return Err(Error::NotFound(format!("本地源 {}", path.display())));
                }
                if path.is_dir() {
                    copy_tree(&path, &dest).map_err(|e| {
                        Error::FetchError(format!("复制 {} 失败: {}", path.display(), e))
                    })?;
                    (dest, None)
                } else {
                    extract_archive(&path, &dest)?;
                    (single_top_level_dir(&dest), None)
                }
            }
            LocationKind::Unsupported => {
                return Err(Error::InvalidSource(format!("不支持的源地址 {}", location)))
            }
        };

        log::info!("已获取 {} -> {}", location, root.display());
        Ok(FetchedSource {
            _workspace: workspace,
            root,
            revision,
        })
    }

    async fn download(&self, url: &Url, workspace: &Path) -> Result<PathBuf> {
        log::info!("下载 {}", url);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::FetchError(format!("请求 {} 失败: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("{} (HTTP 404)", url)));
        }
        if !status.is_success() {
            return Err(Error::FetchError(format!("{} 返回状态码 {}", url, status)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::FetchError(format!("读取 {} 响应失败: {}", url, e)))?;

        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("source.tar");
        let path = workspace.join(file_name);
        fs::write(&path, &bytes)
            .map_err(|e| Error::FetchError(format!("保存 {} 失败: {}", path.display(), e)))?;
        log::debug!("已下载 {} 字节到 {}", bytes.len(), path.display());
        Ok(path)
    }
}

/// `git+https://…` 这类地址交给 git 前去掉前缀
fn git_remote(url: &Url) -> String {
    let raw = url.as_str();
    raw.strip_prefix("git+").unwrap_or(raw).to_string()
}

fn clone_git(url: &Url, reference: Option<&str>, dest: &Path) -> Result<Option<String>> {
    let remote = git_remote(url);
    let mut args: Vec<String> = vec![
        "clone".into(),
        "--quiet".into(),
        "--depth".into(),
        "1".into(),
    ];
    if let Some(reference) = reference {
        args.push("--branch".into());
        args.push(reference.to_string());
    }
    args.push(remote.clone());
    args.push(dest.display().to_string());

    log::info!("git clone {}{}", remote, reference.map(|r| format!(" ({})", r)).unwrap_or_default());
    let output = duct::cmd("git", &args)
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .map_err(|e| Error::FetchError(format!("无法执行 git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(classify_git_failure(&remote, &stderr));
    }

    let revision = duct::cmd!("git", "rev-parse", "HEAD")
        .dir(dest)
        .stderr_null()
        .read()
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    Ok(revision)
}

fn classify_git_failure(remote: &str, stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("not found")
        || lower.contains("does not exist")
        || lower.contains("does not appear to be a git repository")
        || lower.contains("could not find remote branch")
    {
        Error::NotFound(format!("{}: {}", remote, stderr))
    } else {
        Error::FetchError(format!("git clone {} 失败: {}", remote, stderr))
    }
}

fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .map_err(|e| Error::FetchError(format!("创建 {} 失败: {}", dest.display(), e)))?;
    let output = duct::cmd!("tar", "-xf", archive, "-C", dest)
        .stdout_null()
        .stderr_capture()
        .unchecked()
        .run()
        .map_err(|e| Error::FetchError(format!("无法执行 tar: {}", e)))?;
    if !output.status.success() {
        return Err(Error::FetchError(format!(
            "解包 {} 失败: {}",
            archive.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// 归档只包含一个顶层目录时，以它作为源码根目录
fn single_top_level_dir(dest: &Path) -> PathBuf {
    let entries: Vec<PathBuf> = match fs::read_dir(dest) {
        Ok(rd) => rd.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => return dest.to_path_buf(),
    };
    match entries.as_slice() {
        [only] if only.is_dir() => only.clone(),
        _ => dest.to_path_buf(),
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }
        let target = to.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
