//! 定时任务的启用 / 停用，只在用户显式调用时执行

use crate::error::{Error, Result};
use std::path::Path;

pub trait ServiceController {
    fn activate(&self, label: &str, service_file: &Path) -> Result<()>;
    fn deactivate(&self, label: &str) -> Result<()>;
}

/// 通过 `launchctl bootstrap/bootout gui/<uid>` 管理当前用户的任务
#[derive(Debug, Default)]
pub struct Launchctl;

impl Launchctl {
    fn domain() -> String {
        let uid = unsafe { libc::getuid() };
        format!("gui/{}", uid)
    }

    fn run(args: &[String]) -> Result<()> {
        log::debug!("launchctl {}", args.join(" "));
        let output = duct::cmd("launchctl", args)
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .run()
            .map_err(|e| Error::RegistrationError(format!("无法执行 launchctl: {}", e)))?;
        if !output.status.success() {
            return Err(Error::RegistrationError(format!(
                "launchctl {} 失败 (exit={:?}): {}",
                args.first().map(String::as_str).unwrap_or_default(),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl ServiceController for Launchctl {
    fn activate(&self, label: &str, service_file: &Path) -> Result<()> {
        Self::run(&[
            "bootstrap".to_string(),
            Self::domain(),
            service_file.display().to_string(),
        ])?;
        log::info!("已启用定时任务 {}", label);
        Ok(())
    }

    fn deactivate(&self, label: &str) -> Result<()> {
        Self::run(&[
            "bootout".to_string(),
            format!("{}/{}", Self::domain(), label),
        ])?;
        log::info!("已停用定时任务 {}", label);
        Ok(())
    }
}
