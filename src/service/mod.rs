//! 定时任务注册 — 把描述文件中的 schedule 渲染成 launchd 属性列表并写入
//! per-user 配置目录。写入本身不会启用任务。

pub mod launchctl;
pub mod plist;

pub use launchctl::{Launchctl, ServiceController};

use crate::descriptor::ServiceSchedule;
use crate::error::{Error, Result};
use crate::registry::write_atomic;
use self::plist::{Dictionary, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const PREFIX_PLACEHOLDER: &str = "{prefix}";

/// 已解析好的任务定义：label 已确定，`{prefix}` 已替换
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub label: String,
    pub program_arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub hour: u8,
    pub minute: u8,
    pub run_at_load: bool,
    pub auto_enabled: bool,
}

impl ServiceDefinition {
    pub fn resolve(
        name: &str,
        schedule: &ServiceSchedule,
        label_prefix: &str,
        install_prefix: &Path,
    ) -> Result<Self> {
        let label = schedule
            .label
            .clone()
            .unwrap_or_else(|| default_label(label_prefix, name));
        let prefix = install_prefix.display().to_string();
        let program_arguments: Vec<String> = schedule
            .program_arguments
            .iter()
            .map(|arg| arg.replace(PREFIX_PLACEHOLDER, &prefix))
            .collect();

        match program_arguments.first() {
            Some(program) if Path::new(program).is_absolute() => {}
            Some(program) => {
                return Err(Error::RegistrationError(format!(
                    "{} 的程序路径必须是绝对路径: {}",
                    label, program
                )))
            }
            None => {
                return Err(Error::RegistrationError(format!(
                    "{} 缺少程序参数",
                    label
                )))
            }
        }

        Ok(Self {
            label,
            program_arguments,
            environment: schedule.environment.clone(),
            hour: schedule.trigger.hour,
            minute: schedule.trigger.minute,
            run_at_load: schedule.run_at_load,
            auto_enabled: schedule.auto_enabled,
        })
    }

    pub fn to_plist(&self) -> Value {
        let mut env = Dictionary::new();
        for (key, value) in &self.environment {
            env.insert(key.as_str(), value.as_str().into());
        }

        let mut interval = Dictionary::new();
        interval.insert("Hour", Value::Integer(self.hour.into()));
        interval.insert("Minute", Value::Integer(self.minute.into()));

        let mut root = Dictionary::new();
        root.insert("Label", self.label.as_str().into());
        root.insert("EnvironmentVariables", env.into());
        root.insert(
            "ProgramArguments",
            Value::Array(
                self.program_arguments
                    .iter()
                    .map(|arg| Value::from(arg.as_str()))
                    .collect(),
            ),
        );
        root.insert("RunAtLoad", self.run_at_load.into());
        root.insert("StartCalendarInterval", interval.into());
        Value::Dictionary(root)
    }

    pub fn render(&self) -> String {
        plist::to_xml(&self.to_plist())
    }
}

pub fn default_label(label_prefix: &str, name: &str) -> String {
    if label_prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", label_prefix, name)
    }
}

pub struct ServiceRegistrar<'a> {
    launch_agents_dir: &'a Path,
}

impl<'a> ServiceRegistrar<'a> {
    pub fn new(launch_agents_dir: &'a Path) -> Self {
        Self { launch_agents_dir }
    }

    pub fn service_file(&self, label: &str) -> PathBuf {
        self.launch_agents_dir.join(format!("{}.plist", label))
    }

    /// 写入（或覆盖）任务描述文件，返回其路径。不会启用任务
    pub fn register(&self, definition: &ServiceDefinition) -> Result<PathBuf> {
        let path = self.service_file(&definition.label);
        let content = definition.render();
        write_atomic(&path, content.as_bytes()).map_err(|e| {
            Error::RegistrationError(format!("写入 {} 失败: {}", path.display(), e))
        })?;
        log::info!(
            "已写入定时任务 {}（每天 {:02}:{:02}）",
            path.display(),
            definition.hour,
            definition.minute
        );
        Ok(path)
    }

    pub fn unregister(&self, service_file: &Path) -> Result<()> {
        match fs::remove_file(service_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("{} 已不存在", service_file.display());
                Ok(())
            }
            Err(e) => Err(Error::RegistrationError(format!(
                "删除 {} 失败: {}",
                service_file.display(),
                e
            ))),
        }
    }
}
