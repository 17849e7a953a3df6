//! 安装后冒烟测试：运行已安装程序并比较退出码，不重试

use crate::descriptor::VerificationStep;
use crate::error::{Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub expected_exit_code: i32,
    /// 被信号终止时为 None
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.exit_code == Some(self.expected_exit_code)
    }

    /// 未通过时转换成 `VerificationError`，供 `verify` 命令设置退出码
    pub fn into_result(self) -> Result<Self> {
        if self.passed() {
            Ok(self)
        } else {
            Err(Error::VerificationError(format!(
                "{} 退出码 {:?}，期望 {}",
                self.command.display(),
                self.exit_code,
                self.expected_exit_code
            )))
        }
    }

    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// 相对路径的命令按安装前缀解析
pub fn resolve_command(prefix: &Path, command: &str) -> PathBuf {
    let path = Path::new(command);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        prefix.join(path)
    }
}

/// 只有在无法启动进程时才返回错误；退出码不符记录在报告中
pub fn verify(prefix: &Path, step: &VerificationStep) -> Result<VerificationReport> {
    let command = resolve_command(prefix, &step.command);
    log::info!("验证: {} {}", command.display(), step.args.join(" "));

    let output = duct::cmd(&command, &step.args)
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .map_err(|e| {
            Error::VerificationError(format!("无法执行 {}: {}", command.display(), e))
        })?;

    let report = VerificationReport {
        command,
        args: step.args.clone(),
        expected_exit_code: step.expected_exit_code,
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };

    if report.passed() {
        log::info!("验证通过: {}", report.command.display());
    } else {
        log::warn!(
            "验证未通过: {} 退出码 {:?}，期望 {}",
            report.command.display(),
            report.exit_code,
            report.expected_exit_code
        );
    }
    Ok(report)
}
