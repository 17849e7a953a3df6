use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 安装前缀，CopyFile 的 dest_dir 相对于它
    pub prefix: PathBuf,
    /// 已安装包记录与安装锁所在目录
    pub state_dir: PathBuf,
    /// 定时任务描述文件的写入目录（launchd 的 per-user 目录）
    pub launch_agents_dir: PathBuf,
    /// 未指定 label 时使用 `<label_prefix>.<name>`
    pub label_prefix: String,
    pub fetch_timeout_secs: u64,
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl Default for Config {
    fn default() -> Self {
        let home = home_dir();
        Self {
            prefix: home.join(".formulary"),
            state_dir: home.join(".local/state/formulary"),
            launch_agents_dir: home.join("Library/LaunchAgents"),
            label_prefix: "formulary".to_string(),
            fetch_timeout_secs: 300,
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        home_dir().join(".config/formulary/config.toml")
    }

    /// 读取配置文件；不存在时使用默认值。`FORMULARY_PREFIX` 覆盖文件中的前缀。
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("读取配置文件 {} 失败", config_path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("解析配置文件 {} 失败", config_path.display()))?
        } else {
            if path.is_some() {
                anyhow::bail!("配置文件 {} 不存在", config_path.display());
            }
            Self::default()
        };

        if let Ok(prefix) = std::env::var("FORMULARY_PREFIX") {
            if !prefix.trim().is_empty() {
                config.prefix = PathBuf::from(prefix);
            }
        }
        Ok(config)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.prefix)
            .with_context(|| format!("创建安装前缀 {} 失败", self.prefix.display()))?;
        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("创建状态目录 {} 失败", self.state_dir.display()))?;
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("registry.json")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }
}
