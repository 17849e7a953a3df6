//! 同名包的安装互斥，基于 flock(2) 的咨询锁

use crate::error::{Error, Result};
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// 持有期间同名包的其它安装会得到 `AlreadyInstalling`，drop 时释放
#[derive(Debug)]
pub struct InstallLock {
    file: File,
}

impl InstallLock {
    pub fn acquire(lock_dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(lock_dir).map_err(|e| {
            Error::install(format!("创建锁目录 {} 失败: {}", lock_dir.display(), e))
        })?;
        let path = lock_dir.join(format!("{}.lock", name));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::install(format!("打开锁文件 {} 失败: {}", path.display(), e)))?;

        // LOCK_NB：已被占用时立即返回而不是等待
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(Error::AlreadyInstalling(name.to_string()));
            }
            return Err(Error::install(format!("加锁 {} 失败: {}", path.display(), err)));
        }
        log::debug!("已获取安装锁 {}", path.display());
        Ok(Self { file })
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
