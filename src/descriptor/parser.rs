//! 描述文件解析与校验

use super::types::{InstallAction, LocationKind, PackageDescriptor, Source};
use crate::error::{Error, Result};
use std::path::{Component, Path};
use url::Url;

/// 解析 TOML 描述文件文本并校验
pub fn parse_descriptor(text: &str) -> Result<PackageDescriptor> {
    let table = toml::from_str::<toml::Table>(text)
        .map_err(|e| Error::MalformedDescriptor(e.message().to_string()))?;

    // 源地址先单独检查，以便和其它字段错误区分开
    if let Some(location) = table
        .get("source")
        .and_then(|s| s.get("location"))
        .and_then(|l| l.as_str())
    {
        Url::parse(location)
            .map_err(|e| Error::InvalidSource(format!("{}: {}", location, e)))?;
    }

    let descriptor: PackageDescriptor = toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| Error::MalformedDescriptor(e.message().to_string()))?;
    validate(&descriptor)?;
    Ok(descriptor)
}

pub fn load_descriptor(path: &Path) -> Result<PackageDescriptor> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(format!("描述文件 {}", path.display()))
        } else {
            Error::MalformedDescriptor(format!("读取 {} 失败: {}", path.display(), e))
        }
    })?;
    parse_descriptor(&text)
}

/// 序列化回 TOML 文本
pub fn to_toml(descriptor: &PackageDescriptor) -> Result<String> {
    toml::to_string(descriptor).map_err(|e| Error::MalformedDescriptor(e.to_string()))
}

pub fn validate(descriptor: &PackageDescriptor) -> Result<()> {
    validate_name(&descriptor.name)?;
    validate_source(&descriptor.source)?;

    if descriptor.install.is_empty() {
        return Err(Error::MalformedDescriptor(
            "install 至少需要一个安装动作".to_string(),
        ));
    }
    for action in &descriptor.install {
        match action {
            InstallAction::CopyFile { src, dest_dir, mode } => {
                if src.as_os_str().is_empty() {
                    return Err(Error::MalformedDescriptor("copy_file 缺少 src".to_string()));
                }
                ensure_contained(src, "src")?;
                ensure_contained(dest_dir, "dest_dir")?;
                if let Some(mode) = mode {
                    if *mode > 0o7777 {
                        return Err(Error::MalformedDescriptor(format!(
                            "无效的权限 {:o}",
                            mode
                        )));
                    }
                }
            }
        }
    }

    for dep in &descriptor.dependencies {
        if dep.trim().is_empty() {
            return Err(Error::MalformedDescriptor("依赖名不能为空".to_string()));
        }
    }

    if let Some(service) = &descriptor.service {
        if service.program_arguments.is_empty() {
            return Err(Error::MalformedDescriptor(
                "service.program_arguments 不能为空".to_string(),
            ));
        }
        if service.trigger.hour > 23 {
            return Err(Error::MalformedDescriptor(format!(
                "service.trigger.hour 超出范围 0-23: {}",
                service.trigger.hour
            )));
        }
        if service.trigger.minute > 59 {
            return Err(Error::MalformedDescriptor(format!(
                "service.trigger.minute 超出范围 0-59: {}",
                service.trigger.minute
            )));
        }
        if let Some(label) = &service.label {
            if label.trim().is_empty() || label.contains('/') {
                return Err(Error::MalformedDescriptor(format!(
                    "无效的 service.label: {:?}",
                    label
                )));
            }
        }
    }

    if let Some(test) = &descriptor.test {
        if test.command.trim().is_empty() {
            return Err(Error::MalformedDescriptor("test.command 不能为空".to_string()));
        }
    }

    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::MalformedDescriptor("name 不能为空".to_string()));
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '+' | '-'));
    if !valid || name.starts_with('.') {
        return Err(Error::MalformedDescriptor(format!("无效的包名: {:?}", name)));
    }
    Ok(())
}

fn validate_source(source: &Source) -> Result<()> {
    let location = source.location();
    match (source.kind(), source) {
        (LocationKind::Unsupported, _) => Err(Error::InvalidSource(format!(
            "不支持的协议 {}: {}",
            location.scheme(),
            location
        ))),
        (LocationKind::Git, Source::Tag { tag: None, .. }) => Err(Error::InvalidSource(format!(
            "git 源 {} 的 tag 类型必须指定 tag",
            location
        ))),
        (LocationKind::Archive, Source::Head { .. }) => Err(Error::InvalidSource(format!(
            "归档地址 {} 没有 head 引用",
            location
        ))),
        (LocationKind::Archive | LocationKind::Local, Source::Tag { tag: Some(t), .. }) => {
            Err(Error::InvalidSource(format!(
                "{} 不是 git 源，tag {} 不会生效",
                location, t
            )))
        }
        (_, Source::Tag { tag: Some(t), .. }) if t.trim().is_empty() => {
            Err(Error::InvalidSource("tag 不能为空".to_string()))
        }
        (_, Source::Head { branch: Some(b), .. }) if b.trim().is_empty() => {
            Err(Error::InvalidSource("branch 不能为空".to_string()))
        }
        _ => Ok(()),
    }
}

/// 路径必须是相对路径且不能跳出所在目录
fn ensure_contained(path: &Path, field: &str) -> Result<()> {
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(Error::MalformedDescriptor(format!(
                    "{} 必须是不含 .. 的相对路径: {}",
                    field,
                    path.display()
                )))
            }
        }
    }
    Ok(())
}
