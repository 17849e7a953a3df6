//! 描述文件相关数据类型定义

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use url::Url;

/// 一个包的声明式描述，安装时只读
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    pub homepage: Url,
    pub source: Source,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub dependencies: BTreeSet<String>,
    pub install: Vec<InstallAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<VerificationStep>,
}

/// 源码位置：固定 tag 快照，或可变的 head 引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Source {
    Tag {
        location: Url,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
    },
    /// 每次获取的结果可能不同
    Head {
        location: Url,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
}

impl Source {
    pub fn location(&self) -> &Url {
        match self {
            Source::Tag { location, .. } | Source::Head { location, .. } => location,
        }
    }

    pub fn is_head(&self) -> bool {
        matches!(self, Source::Head { .. })
    }

    pub fn kind(&self) -> LocationKind {
        LocationKind::of(self.location())
    }
}

/// 源地址的获取方式，由 URL 推断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Git,
    Archive,
    Local,
    Unsupported,
}

impl LocationKind {
    pub fn of(url: &Url) -> Self {
        match url.scheme() {
            "file" => LocationKind::Local,
            "git" | "ssh" => LocationKind::Git,
            s if s.starts_with("git+") => LocationKind::Git,
            "http" | "https" => {
                if url.path().trim_end_matches('/').ends_with(".git") {
                    LocationKind::Git
                } else {
                    LocationKind::Archive
                }
            }
            _ => LocationKind::Unsupported,
        }
    }
}

/// 安装动作。以 `action` 字段区分，新增动作类型不影响已有描述文件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InstallAction {
    CopyFile {
        /// 相对于源码根目录
        src: PathBuf,
        /// 相对于安装前缀
        dest_dir: PathBuf,
        /// 覆盖源文件权限，如 `0o755`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
    },
}

/// 定时任务，渲染为 launchd 属性列表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSchedule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// 第一个元素是已安装程序的绝对路径，`{prefix}` 会被替换为安装前缀
    pub program_arguments: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    pub trigger: CalendarTrigger,
    #[serde(default)]
    pub run_at_load: bool,
    /// 默认 false：只写入描述文件，需要用户手动 activate
    #[serde(default)]
    pub auto_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarTrigger {
    pub hour: u8,
    pub minute: u8,
}

/// 安装后的冒烟测试
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStep {
    /// 相对路径按安装前缀解析
    pub command: String,
    #[serde(default = "default_verification_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub expected_exit_code: i32,
}

fn default_verification_args() -> Vec<String> {
    vec!["--help".to_string()]
}
