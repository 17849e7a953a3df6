//! 安装器 — 按声明顺序执行安装动作，写入安装前缀
//!
//! 任何一个动作失败都会立即停止；之前已经复制的文件保留在前缀中，
//! 并通过 `Error::InstallError::written` 返回给调用方。

pub mod lock;

pub use lock::InstallLock;

use crate::descriptor::InstallAction;
use crate::error::{Error, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub struct Installer<'a> {
    prefix: &'a Path,
}

impl<'a> Installer<'a> {
    pub fn new(prefix: &'a Path) -> Self {
        Self { prefix }
    }

    /// 执行全部动作，返回写入的文件（按执行顺序）
    pub fn run(&self, tree: &Path, actions: &[InstallAction]) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();

        for (index, action) in actions.iter().enumerate() {
            match self.apply(tree, action) {
                Ok(path) => {
                    log::info!("[{}/{}] 已安装 {}", index + 1, actions.len(), path.display());
                    written.push(path);
                }
                Err(message) => {
                    log::error!("[{}/{}] {}", index + 1, actions.len(), message);
                    return Err(Error::InstallError { message, written });
                }
            }
        }

        Ok(written)
    }

    fn apply(&self, tree: &Path, action: &InstallAction) -> std::result::Result<PathBuf, String> {
        match action {
            InstallAction::CopyFile {
                src,
                dest_dir,
                mode,
            } => {
                let source = tree.join(src);
                if !source.is_file() {
                    return Err(format!("源码中不存在文件 {}", src.display()));
                }
                let file_name = source
                    .file_name()
                    .ok_or_else(|| format!("无法确定文件名: {}", src.display()))?;

                let target_dir = self.prefix.join(dest_dir);
                fs::create_dir_all(&target_dir)
                    .map_err(|e| format!("创建目录 {} 失败: {}", target_dir.display(), e))?;

                let target = target_dir.join(file_name);
                // 先删掉旧文件：上次安装留下的只读文件无法以写方式打开
                match fs::remove_file(&target) {
                    Ok(()) => log::debug!("替换已有文件 {}", target.display()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(format!("删除已有文件 {} 失败: {}", target.display(), e))
                    }
                }
                // fs::copy 会同时复制权限位
                fs::copy(&source, &target).map_err(|e| {
                    format!(
                        "复制 {} 到 {} 失败: {}",
                        src.display(),
                        target.display(),
                        e
                    )
                })?;

                if let Some(mode) = mode {
                    fs::set_permissions(&target, fs::Permissions::from_mode(*mode)).map_err(
                        |e| format!("设置 {} 权限 {:o} 失败: {}", target.display(), mode, e),
                    )?;
                }
                Ok(target)
            }
        }
    }
}

/// 删除已安装文件，并清理前缀内因此变空的目录。缺失的文件只记录警告
pub fn remove_files(prefix: &Path, files: &[PathBuf]) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for file in files {
        match fs::remove_file(file) {
            Ok(()) => removed.push(file.clone()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("{} 已不存在，跳过", file.display());
            }
            Err(e) => log::warn!("删除 {} 失败: {}", file.display(), e),
        }

        let mut dir = file.parent();
        while let Some(d) = dir {
            if d == prefix || !d.starts_with(prefix) {
                break;
            }
            // 目录非空时 remove_dir 失败，正好停止向上清理
            if fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
    removed
}
