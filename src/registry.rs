//! 已安装包记录。由调用方注入，安装流程本身不持有全局状态

use crate::descriptor::PackageDescriptor;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

const REGISTRY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub descriptor: PackageDescriptor,
    /// git 源记录实际检出的提交
    pub revision: Option<String>,
    pub files: Vec<PathBuf>,
    pub service_file: Option<PathBuf>,
    pub installed_at: DateTime<Utc>,
}

impl InstalledPackage {
    /// 列表中显示的短版本号：前 7 个字符，没有版本时为 "-"
    pub fn short_revision(&self) -> &str {
        match self.revision.as_deref() {
            Some(r) => match r.char_indices().nth(7) {
                Some((end, _)) => &r[..end],
                None => r,
            },
            None => "-",
        }
    }
}

pub trait PackageRegistry {
    fn get(&self, name: &str) -> Result<Option<InstalledPackage>>;
    /// 同名记录会被替换
    fn record(&mut self, package: InstalledPackage) -> Result<()>;
    fn remove(&mut self, name: &str) -> Result<Option<InstalledPackage>>;
    fn list(&self) -> Result<Vec<InstalledPackage>>;

    fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.get(name)?.is_some())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    packages: BTreeMap<String, InstalledPackage>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PackageRegistry for MemoryRegistry {
    fn get(&self, name: &str) -> Result<Option<InstalledPackage>> {
        Ok(self.packages.get(name).cloned())
    }

    fn record(&mut self, package: InstalledPackage) -> Result<()> {
        self.packages.insert(package.name.clone(), package);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<Option<InstalledPackage>> {
        Ok(self.packages.remove(name))
    }

    fn list(&self) -> Result<Vec<InstalledPackage>> {
        Ok(self.packages.values().cloned().collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    schema_version: u32,
    packages: BTreeMap<String, InstalledPackage>,
}

/// 以 JSON 文件保存的记录
///
/// 不缓存内容：每次读取都从磁盘加载，每次修改都在 `registry.lock` 上加排它锁后
/// 重新读取、修改、整体重写，不同包的并发安装不会互相覆盖记录。
#[derive(Debug)]
pub struct JsonRegistry {
    path: PathBuf,
}

impl JsonRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        let registry = Self {
            path: path.to_path_buf(),
        };
        registry.load()?;
        Ok(registry)
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn load(&self) -> Result<BTreeMap<String, InstalledPackage>> {
        let path = &self.path;
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Registry(format!("读取 {} 失败: {}", path.display(), e)))?;
        let file: RegistryFile = serde_json::from_str(&raw)
            .map_err(|e| Error::Registry(format!("解析 {} 失败: {}", path.display(), e)))?;
        if file.schema_version != REGISTRY_SCHEMA_VERSION {
            return Err(Error::Registry(format!(
                "不支持的记录版本 {}（期望 {}）",
                file.schema_version, REGISTRY_SCHEMA_VERSION
            )));
        }
        Ok(file.packages)
    }

    fn save(&self, packages: BTreeMap<String, InstalledPackage>) -> Result<()> {
        let file = RegistryFile {
            schema_version: REGISTRY_SCHEMA_VERSION,
            packages,
        };
        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::Registry(format!("序列化失败: {}", e)))?;
        write_atomic(&self.path, content.as_bytes())
            .map_err(|e| Error::Registry(format!("写入 {} 失败: {}", self.path.display(), e)))
    }

    /// 持锁完成 读取 → 修改 → 写回
    fn update<T>(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, InstalledPackage>) -> T,
    ) -> Result<T> {
        let _lock = RegistryLock::exclusive(&self.lock_path())?;
        let mut packages = self.load()?;
        let result = change(&mut packages);
        self.save(packages)?;
        Ok(result)
    }
}

impl PackageRegistry for JsonRegistry {
    fn get(&self, name: &str) -> Result<Option<InstalledPackage>> {
        Ok(self.load()?.remove(name))
    }

    fn record(&mut self, package: InstalledPackage) -> Result<()> {
        self.update(|packages| {
            packages.insert(package.name.clone(), package);
        })
    }

    fn remove(&mut self, name: &str) -> Result<Option<InstalledPackage>> {
        self.update(|packages| packages.remove(name))
    }

    fn list(&self) -> Result<Vec<InstalledPackage>> {
        Ok(self.load()?.into_values().collect())
    }
}

/// 记录文件的写锁。与安装锁不同，这里阻塞等待对方写完
struct RegistryLock {
    file: File,
}

impl RegistryLock {
    fn exclusive(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Registry(format!("创建目录 {} 失败: {}", parent.display(), e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| Error::Registry(format!("打开锁文件 {} 失败: {}", path.display(), e)))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(Error::Registry(format!(
                "加锁 {} 失败: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self { file })
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// 先写同目录临时文件再 rename，避免中途失败留下半个文件
pub fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut tmp, content)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
